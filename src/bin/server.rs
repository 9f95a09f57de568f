use std::env;
use std::net::Ipv4Addr;
use std::process::exit;

use rcmecho::EchoServer;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("usage: {} <port>", args[0]);
        exit(-1);
    }
    let port: u16 = match args[1].parse() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("invalid port: {}", args[1]);
            exit(-1);
        }
    };

    let mut server = EchoServer::new();
    if let Err(err) = server.listen(Ipv4Addr::UNSPECIFIED, port) {
        eprintln!("server error: {err:#}");
        exit(1);
    }
}
