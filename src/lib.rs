pub mod debugger;

pub use debugger::Debugger;

/// Transform the error into a log record and go on.
/// Usable for errors that must not abort the current operation.
#[macro_export]
macro_rules! weak_error {
    ($res:expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "debugger", "{e:#}");
                None
            }
        }
    };
    ($res:expr; $msg:expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "debugger", "{}: {e:#}", $msg);
                None
            }
        }
    };
}
