//! Log macros tagging each line with the campaign it belongs to.

#[macro_export]
macro_rules! job_debug {
    ($id: expr, $t: tt) => (
        log::debug!(std::concat!("[{}] ", $t), $id)
    );
    ($id: expr, $t: tt, $($arg:tt)*) => (
        log::debug!(std::concat!("[{}] ", $t), $id, $($arg)*)
    )
}

#[macro_export]
macro_rules! job_info {
    ($id: expr, $t: tt) => (
        log::info!(std::concat!("[{}] ", $t), $id)
    );
    ($id: expr, $t: tt, $($arg:tt)*) => (
        log::info!(std::concat!("[{}] ", $t), $id, $($arg)*)
    )
}

#[macro_export]
macro_rules! job_warn {
    ($id: expr, $t: tt) => (
        log::warn!(std::concat!("[{}] ", $t), $id)
    );
    ($id: expr, $t: tt, $($arg:tt)*) => (
        log::warn!(std::concat!("[{}] ", $t), $id, $($arg)*)
    )
}
