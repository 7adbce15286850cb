//! Stop-the-world mark/sweep collection over the store's pools.

use super::value::{ObjectId, Value};
use super::{ValueStore, INITIAL_GC_THRESHOLD};

impl ValueStore {
    /// Run a full collection.
    ///
    /// The root set is the union of every locked object, the caller's
    /// `roots` slice (the engine passes frames, imports, the pending
    /// catchable and registered externals), and everything transitively
    /// reachable from either. Unmarked objects are swept with their
    /// finalizers run exactly once; unmarked strings are swept only when
    /// their reference count is also zero. Returns the number of bodies
    /// reclaimed.
    pub fn collect(&mut self, roots: &[Value]) -> usize {
        for obj in self.objects.iter_mut() {
            obj.marked = false;
        }
        for body in self.strings.iter_mut() {
            body.marked = false;
        }

        let mut work: Vec<ObjectId> = Vec::new();

        let locked: Vec<(u32, u32)> = self
            .objects
            .handles()
            .filter(|(i, g)| {
                self.objects
                    .get(*i, *g)
                    .map(|obj| obj.lock_count > 0)
                    .unwrap_or(false)
            })
            .collect();
        for (index, generation) in locked {
            self.mark_value(&Value::Object(ObjectId { index, generation }), &mut work);
        }

        for root in roots {
            self.mark_value(root, &mut work);
        }

        let mut traced = Vec::new();
        while let Some(id) = work.pop() {
            traced.clear();
            if let Some(obj) = self.objects.get(id.index, id.generation) {
                obj.trace(&mut traced);
            }
            for value in &traced {
                self.mark_value(value, &mut work);
            }
        }

        let freed = self.sweep();
        self.collections += 1;
        self.allocations = 0;
        self.gc_threshold =
            ((self.objects.len() + self.strings.len()) * 2).max(INITIAL_GC_THRESHOLD);
        freed
    }

    fn mark_value(&mut self, value: &Value, work: &mut Vec<ObjectId>) {
        match value {
            Value::String(id) => {
                if let Some(body) = self.strings.get_mut(id.index, id.generation) {
                    body.marked = true;
                }
            }
            Value::Object(id) => {
                if let Some(obj) = self.objects.get_mut(id.index, id.generation) {
                    if !obj.marked {
                        obj.marked = true;
                        work.push(*id);
                    }
                }
            }
            _ => {}
        }
    }

    fn sweep(&mut self) -> usize {
        let dead_strings: Vec<(u32, u32)> = self
            .strings
            .handles()
            .filter(|(i, g)| {
                self.strings
                    .get(*i, *g)
                    .map(|body| body.refs == 0 && !body.marked)
                    .unwrap_or(false)
            })
            .collect();
        let mut freed = 0;
        for (index, generation) in dead_strings {
            if let Some(body) = self.strings.remove(index, generation) {
                self.interned.remove(body.text.as_ref());
                freed += 1;
            }
        }

        let dead_objects: Vec<(u32, u32)> = self
            .objects
            .handles()
            .filter(|(i, g)| {
                self.objects
                    .get(*i, *g)
                    .map(|obj| !obj.marked)
                    .unwrap_or(false)
            })
            .collect();
        for (index, generation) in dead_objects {
            if let Some(mut obj) = self.objects.remove(index, generation) {
                if let Some(finalizer) = obj.finalizer.take() {
                    finalizer(obj.userdata.take());
                }
                freed += 1;
            }
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_unreferenced_object_is_swept() {
        let mut store = ValueStore::new();
        let obj = store.create_object();
        assert_eq!(store.live_object_count(), 1);
        store.collect(&[]);
        assert_eq!(store.live_object_count(), 0);
        assert!(!store.is_live(&obj));
    }

    #[test]
    fn test_locked_object_survives_until_unlocked() {
        let mut store = ValueStore::new();
        let obj = store.create_object();
        store.push_lock(&obj);
        store.collect(&[]);
        assert!(store.is_live(&obj));

        store.pop_lock(&obj);
        store.collect(&[]);
        assert!(!store.is_live(&obj));
    }

    #[test]
    fn test_nested_locks() {
        let mut store = ValueStore::new();
        let obj = store.create_object();
        store.push_lock(&obj);
        store.push_lock(&obj);
        store.pop_lock(&obj);
        store.collect(&[]);
        assert!(store.is_live(&obj));
        store.pop_lock(&obj);
        store.collect(&[]);
        assert!(!store.is_live(&obj));
    }

    #[test]
    fn test_reachable_members_survive() {
        let mut store = ValueStore::new();
        let root = store.create_object();
        let child = store.create_object();
        let name = store.create_string("child");
        store.object_set(&root, &name, child).unwrap();
        store.recycle_value(&name);

        store.collect(&[root]);
        assert!(store.is_live(&root));
        assert!(store.is_live(&child));
        assert!(store.is_live(&name));

        store.collect(&[]);
        assert!(!store.is_live(&child));
    }

    #[test]
    fn test_cycle_is_reclaimed() {
        let mut store = ValueStore::new();
        let a = store.create_object();
        let b = store.create_object();
        store.object_set_str(&a, "other", b).unwrap();
        store.object_set_str(&b, "other", a).unwrap();

        store.collect(&[a]);
        assert!(store.is_live(&a));
        assert!(store.is_live(&b));

        store.collect(&[]);
        assert!(!store.is_live(&a));
        assert!(!store.is_live(&b));
    }

    #[test]
    fn test_finalizer_runs_exactly_once() {
        let mut store = ValueStore::new();
        let runs = Rc::new(RefCell::new(0));
        let obj = store.create_object();
        store.push_lock(&obj);
        let counter = Rc::clone(&runs);
        store
            .set_finalizer(
                &obj,
                Box::new(move |_| {
                    *counter.borrow_mut() += 1;
                }),
            )
            .unwrap();

        store.collect(&[]);
        assert_eq!(*runs.borrow(), 0);

        store.pop_lock(&obj);
        store.collect(&[]);
        assert_eq!(*runs.borrow(), 1);

        store.collect(&[]);
        assert_eq!(*runs.borrow(), 1);
    }

    #[test]
    fn test_finalizer_receives_userdata() {
        let mut store = ValueStore::new();
        let seen = Rc::new(RefCell::new(None));
        let obj = store.create_object();
        store.set_userdata(&obj, Box::new(41u32)).unwrap();
        let out = Rc::clone(&seen);
        store
            .set_finalizer(
                &obj,
                Box::new(move |data| {
                    let n = data.and_then(|d| d.downcast::<u32>().ok()).map(|d| *d);
                    *out.borrow_mut() = n;
                }),
            )
            .unwrap();
        store.collect(&[]);
        assert_eq!(*seen.borrow(), Some(41));
    }

    #[test]
    fn test_alias_count_does_not_root_an_object() {
        let mut store = ValueStore::new();
        let obj = store.create_object();
        store.copy_value(&obj);
        assert_eq!(store.reference_count(&obj), 2);
        // Reachability alone decides object survival; an outstanding alias
        // count must not keep a cycle candidate alive.
        store.collect(&[]);
        assert!(!store.is_live(&obj));
        assert_eq!(store.reference_count(&obj), 0);
    }

    #[test]
    fn test_retained_string_survives_without_roots() {
        let mut store = ValueStore::new();
        let s = store.create_string("kept");
        store.collect(&[]);
        assert!(store.is_live(&s));

        store.recycle_value(&s);
        store.collect(&[]);
        assert!(!store.is_live(&s));
    }

    #[test]
    fn test_swept_string_can_be_recreated() {
        let mut store = ValueStore::new();
        let a = store.create_string("transient");
        store.recycle_value(&a);
        store.collect(&[]);
        assert!(!store.is_live(&a));

        let b = store.create_string("transient");
        assert!(store.is_live(&b));
        assert_ne!(a, b);
        assert_eq!(store.string_content(&b), Some("transient"));
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let mut store = ValueStore::new();
        let old = store.create_object();
        store.collect(&[]);
        let new = store.create_object();
        // The vacated slot may be reused; the stale handle must stay dead.
        assert!(!store.is_live(&old));
        assert!(store.is_live(&new));
        assert_eq!(store.object_key_count(&old).ok(), None);
    }

    #[test]
    fn test_collection_counters() {
        let mut store = ValueStore::new();
        assert_eq!(store.collection_count(), 0);
        store.collect(&[]);
        store.collect(&[]);
        assert_eq!(store.collection_count(), 2);
    }
}
