/// Slightly louder than `debug!`, matching the call sites that want a trace
/// of routine control-flow (dispatch, IPC frames) without promoting them to
/// `info!`.
#[macro_export]
macro_rules! verbose {
    ($($arg:tt)*) => {
        log::debug!($($arg)*)
    };
}
