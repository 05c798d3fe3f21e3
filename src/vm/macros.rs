macro_rules! vm_pop {
    ($frame:expr) => {
        $frame
            .stack
            .pop()
            .ok_or($crate::vm::error::ExecutionError::StackUnderflow)?
    };
}

macro_rules! vm_push {
    ($frame:expr, $variant:ident ( $($args:expr),* )) => {
        $frame.stack.push($crate::vm::value::StackValue::$variant($($args),*))
    };
    ($frame:expr, $val:expr) => {
        $frame.stack.push($val)
    };
}

macro_rules! vm_expect_stack {
    (let $variant:ident ( $inner:ident $(as $t:ty)? ) = $v:expr) => {
        let $inner = match $v {
            $crate::vm::value::StackValue::$variant($inner) => $inner,
            other => {
                return Err($crate::vm::error::type_mismatch(stringify!($variant), other));
            }
        };
        $(
            let $inner = $inner as $t;
        )?
    };
}

/// Destructures a native method's argument vector into a fixed-size array.
macro_rules! native_args {
    ($args:expr, $n:literal) => {
        <[$crate::vm::value::StackValue; $n]>::try_from($args)
            .map_err(|_| $crate::vm::error::ExecutionError::StackUnderflow)?
    };
}
