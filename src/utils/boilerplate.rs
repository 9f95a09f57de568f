macro_rules! impl_ptr_wrapper_traits {
    ($raw_ty:ty, $wrapper_ty:ty) => {
        impl ::std::ops::Deref for $wrapper_ty {
            type Target = ::std::ptr::NonNull<$raw_ty>;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<::std::ptr::NonNull<$raw_ty>> for $wrapper_ty {
            fn from(pointer: ::std::ptr::NonNull<$raw_ty>) -> Self {
                Self(pointer)
            }
        }

        unsafe impl Send for $wrapper_ty {}
        unsafe impl Sync for $wrapper_ty {}
    };
}

pub(crate) use impl_ptr_wrapper_traits;
