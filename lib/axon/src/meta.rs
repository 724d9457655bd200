//! Class metadata and the process-wide metatype registry.
//!
//! A `MetaObject` is a static per-class record with a parent pointer; walking
//! the chain answers "is this a Device?" style queries without language-level
//! inheritance. The metatype registry hands out stable numeric identities for
//! value types carried in variants.

use std::sync::Mutex;

use hashbrown::HashMap;
use lazy_static::lazy_static;

/// Static per-class metadata record.
pub struct MetaObject {
    pub class_name: &'static str,
    pub parent: Option<&'static MetaObject>,
}

impl MetaObject {
    #[inline]
    pub const fn new(class_name: &'static str, parent: Option<&'static MetaObject>) -> MetaObject {
        MetaObject { class_name, parent }
    }

    /// Walk the inheritance list looking for `class_name`.
    pub fn inherits(&self, class_name: &str) -> bool {
        let mut current = Some(self);

        while let Some(meta) = current {
            if meta.class_name == class_name {
                return true;
            }
            current = meta.parent;
        }

        false
    }
}

/// Root metaobject every other record ultimately points at.
pub static OBJECT_META: MetaObject = MetaObject::new("Object", None);

lazy_static! {
    static ref METATYPES: Mutex<HashMap<&'static str, u32>> = Mutex::new(HashMap::new());
}

/// Register a value type and return its stable numeric identity. Repeated
/// registration of the same type returns the same id.
pub fn register_metatype<T: 'static>() -> u32 {
    let name = std::any::type_name::<T>();
    let mut types = METATYPES.lock().expect("metatype registry poisoned");
    let next = types.len() as u32 + 1;

    *types.entry(name).or_insert(next)
}

/// Look up a previously registered type id by name.
pub fn metatype_id(name: &str) -> Option<u32> {
    let types = METATYPES.lock().expect("metatype registry poisoned");
    types.get(name).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    static BASE: MetaObject = MetaObject::new("Base", Some(&OBJECT_META));
    static DERIVED: MetaObject = MetaObject::new("Derived", Some(&BASE));

    #[test]
    fn test_inherits_walks_chain() {
        assert!(DERIVED.inherits("Derived"));
        assert!(DERIVED.inherits("Base"));
        assert!(DERIVED.inherits("Object"));
        assert!(!DERIVED.inherits("Other"));
    }

    #[test]
    fn test_metatype_registration_is_stable() {
        let first = register_metatype::<[u8; 7]>();
        let second = register_metatype::<[u8; 7]>();

        assert_eq!(first, second);
        assert_eq!(metatype_id(std::any::type_name::<[u8; 7]>()), Some(first));
    }
}
