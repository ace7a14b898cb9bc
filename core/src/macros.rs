// Logging goes through `tracing` when the feature is on; otherwise the arguments are only
// type-checked.

#[cfg(not(feature = "tracing"))]
macro_rules! debug {
    ($($t: tt)*) => {
        if false {
            let _ = format_args!($($t)*);
        }
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! info {
    ($($t: tt)*) => {
        if false {
            let _ = format_args!($($t)*);
        }
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn {
    ($($t: tt)*) => {
        if false {
            let _ = format_args!($($t)*);
        }
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! error {
    ($($t: tt)*) => {
        if false {
            let _ = format_args!($($t)*);
        }
    };
}
