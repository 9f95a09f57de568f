use std::env;
use std::process::exit;

use anyhow::Result;
use rcmecho::EchoClient;

fn run(host: &str, port: u16, message: &str) -> Result<()> {
    let mut client = EchoClient::connect(host, port)?;
    client.post_send(message)?;
    println!("client send: {message}");
    println!("client recv: {}", client.post_recv()?);
    client.close()?;
    Ok(())
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 4 {
        eprintln!("usage: {} <server-ip> <port> <message>", args[0]);
        exit(-1);
    }
    let port: u16 = match args[2].parse() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("invalid port: {}", args[2]);
            exit(-1);
        }
    };

    if let Err(err) = run(&args[1], port, &args[3]) {
        eprintln!("client error: {err:#}");
        exit(1);
    }
}
