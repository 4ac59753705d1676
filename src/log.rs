//! Allocator logging.
//!
//! This allows for detailed logging for `chunkalloc`.

/// Log to the appropriate source.
///
/// The first argument is the level, one of `INTERNAL`, `DEBUG`, `NOTE`, `WARNING` and `ERROR`.
/// The rest of the arguments are just normal formatters.
///
/// With the `log` feature, the message is handed to the `log` facade. Without it nothing is
/// written, although the arguments are still type checked. Note that a logger which allocates
/// through this very allocator will deadlock, so only enable the feature with a non-allocating
/// logger, or when the heap is not the global allocator.
macro_rules! log {
    (INTERNAL, $( $arg:tt )*) => {
        log!(@Trace, $( $arg )*)
    };
    (DEBUG, $( $arg:tt )*) => {
        log!(@Debug, $( $arg )*)
    };
    (NOTE, $( $arg:tt )*) => {
        log!(@Info, $( $arg )*)
    };
    (WARNING, $( $arg:tt )*) => {
        log!(@Warn, $( $arg )*)
    };
    (ERROR, $( $arg:tt )*) => {
        log!(@Error, $( $arg )*)
    };
    (@$lv:ident, $( $arg:tt )*) => {{
        #[cfg(feature = "log")]
        {
            ::log::log!(target: "chunkalloc", ::log::Level::$lv, $( $arg )*);
        }

        #[cfg(not(feature = "log"))]
        {
            let _ = format_args!($( $arg )*);
        }
    }};
}
