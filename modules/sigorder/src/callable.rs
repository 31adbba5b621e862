//! Type-erased slot callables.

use std::any::Any;

/// What a slot returns. Errors are collected by `emit` and do not stop the
/// remaining slots from firing.
pub type SlotResult = anyhow::Result<()>;

/// A stored slot: invocable with `&A`, and able to expose its concrete value
/// so `disconnect(&value)` can find it again.
pub trait Callback<A: ?Sized>: 'static {
    fn invoke(&self, args: &A) -> SlotResult;

    fn target(&self) -> &dyn Any;
}

impl<A, F> Callback<A> for F
where
    A: ?Sized,
    F: Fn(&A) -> SlotResult + 'static,
{
    fn invoke(&self, args: &A) -> SlotResult {
        self(args)
    }

    fn target(&self) -> &dyn Any {
        self
    }
}

/// True when `callback` stores a `T` equal to `value`.
pub(crate) fn holds<A, T>(callback: &dyn Callback<A>, value: &T) -> bool
where
    A: ?Sized + 'static,
    T: PartialEq + 'static,
{
    callback
        .target()
        .downcast_ref::<T>()
        .is_some_and(|stored| stored == value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn double(v: &i32) -> SlotResult {
        anyhow::ensure!(*v * 2 < 100, "too big");
        Ok(())
    }

    #[test]
    fn function_pointer_is_found_by_value() {
        let slot: fn(&i32) -> SlotResult = double;
        let boxed: Box<dyn Callback<i32>> = Box::new(slot);

        assert!(holds(boxed.as_ref(), &slot));
        assert!(!holds(boxed.as_ref(), &1_u8));
        assert!(boxed.invoke(&3).is_ok());
        assert!(boxed.invoke(&60).is_err());
    }
}
