macro_rules! ensure_eq {
    ($lhs:expr, $rhs:expr) => {
        ensure_eq!($lhs, $rhs, "expected `{:?}` to equal `{:?}`", $lhs, $rhs)
    };
    ($lhs:expr, $rhs:expr, $($args:tt)*) => {
        ensure!($lhs == $rhs, $($args)*)
    };
}
