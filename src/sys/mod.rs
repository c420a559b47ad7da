//! Platform-specific trap handler installation.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub(crate) mod unix;
        pub use unix::SignalHandler;
        pub(crate) use unix::{lazy_per_thread_init, platform_init};
    } else if #[cfg(windows)] {
        pub(crate) mod windows;
        pub use windows::SignalHandler;
        pub(crate) use windows::{lazy_per_thread_init, platform_init};
    } else {
        compile_error!("trap handling is only supported on unix and windows");
    }
}
