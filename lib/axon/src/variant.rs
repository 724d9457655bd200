//! Dynamically typed argument values.
//!
//! Signal arguments and object properties travel as `Variant`s: cheap to
//! clone (`Arc` payload), safe to move across threads, and carrying the
//! registered type name of the stored value for diagnostics.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::meta;

/// An any-value with registered type identity.
#[derive(Clone)]
pub struct Variant {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl Variant {
    /// Wrap a value. The value's type is registered with the process-wide
    /// metatype registry on first use.
    pub fn new<T: Any + Send + Sync>(value: T) -> Variant {
        meta::register_metatype::<T>();

        Variant {
            type_name: std::any::type_name::<T>(),
            value: Arc::new(value),
        }
    }

    /// An empty variant, used where a slot argument list must be padded.
    #[inline]
    pub fn empty() -> Variant {
        Variant::new(())
    }

    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Borrow the stored value, if it has the requested type.
    #[inline]
    pub fn value<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Clone the stored value out of the variant.
    #[inline]
    pub fn get<T: Any + Clone>(&self) -> Option<T> {
        self.value::<T>().cloned()
    }

    #[inline]
    pub fn is<T: Any>(&self) -> bool {
        self.value::<T>().is_some()
    }

    /// Wrap a move-only value. The payload can be extracted exactly once
    /// with [`Variant::take`]; later calls return `None`.
    pub fn envelope<T: Any + Send>(value: T) -> Variant {
        Variant::new(Mutex::new(Some(value)))
    }

    /// Extract a payload stored with [`Variant::envelope`].
    pub fn take<T: Any + Send>(&self) -> Option<T> {
        let cell = self.value::<Mutex<Option<T>>>()?;
        cell.lock().expect("variant envelope poisoned").take()
    }
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Variant({})", self.type_name)
    }
}

impl From<bool> for Variant {
    #[inline]
    fn from(v: bool) -> Variant {
        Variant::new(v)
    }
}

impl From<i32> for Variant {
    #[inline]
    fn from(v: i32) -> Variant {
        Variant::new(v)
    }
}

impl From<u32> for Variant {
    #[inline]
    fn from(v: u32) -> Variant {
        Variant::new(v)
    }
}

impl From<u64> for Variant {
    #[inline]
    fn from(v: u64) -> Variant {
        Variant::new(v)
    }
}

impl From<String> for Variant {
    #[inline]
    fn from(v: String) -> Variant {
        Variant::new(v)
    }
}

impl From<&str> for Variant {
    #[inline]
    fn from(v: &str) -> Variant {
        Variant::new(v.to_string())
    }
}

impl From<Vec<u8>> for Variant {
    #[inline]
    fn from(v: Vec<u8>) -> Variant {
        Variant::new(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let v = Variant::new(42u32);

        assert_eq!(v.get::<u32>(), Some(42));
        assert_eq!(v.get::<i32>(), None);
        assert!(v.is::<u32>());
    }

    #[test]
    fn test_clone_shares_payload() {
        let v = Variant::new(String::from("payload"));
        let w = v.clone();

        assert_eq!(w.value::<String>().unwrap(), "payload");
        assert_eq!(v.value::<String>().unwrap(), "payload");
    }

    #[test]
    fn test_envelope_take_once() {
        struct MoveOnly(Vec<u8>);

        let v = Variant::envelope(MoveOnly(vec![1, 2, 3]));

        let first = v.take::<MoveOnly>();
        assert!(first.is_some());
        assert_eq!(first.unwrap().0, vec![1, 2, 3]);
        assert!(v.take::<MoveOnly>().is_none());
    }

    #[test]
    fn test_type_name() {
        let v = Variant::new(7i32);
        assert!(v.type_name().contains("i32"));
    }
}
