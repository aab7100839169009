/// Turns a fallible cleanup step into a logged, best-effort one.
pub trait ResultOkLogExt<T, E> {
    /// Logs the error (prefixed by `what`) and discards it.
    fn ok_log(self, what: &str) -> Option<T>;
}

impl<T, E> ResultOkLogExt<T, E> for std::result::Result<T, E>
where
    E: std::error::Error,
{
    fn ok_log(self, what: &str) -> Option<T> {
        match self {
            Ok(ok) => Some(ok),
            Err(err) => {
                log::error!("{what}: {err}");
                None
            }
        }
    }
}
