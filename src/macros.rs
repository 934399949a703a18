/// `bug_on!(cond)` panics with a message naming the source location, mirroring
/// the core's "never recover from an assertion violation" error policy: a
/// violated invariant goes straight to the panic path rather than being
/// reported as an ordinary error.
#[macro_export]
macro_rules! bug_on {
    ($cond:expr) => {
        if $cond {
            panic!("bug: {} at {}:{}", stringify!($cond), file!(), line!());
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if $cond {
            panic!("bug: {} ({}) at {}:{}", stringify!($cond), format_args!($($arg)+), file!(), line!());
        }
    };
}
