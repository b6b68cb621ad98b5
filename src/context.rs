// The MIT License (MIT)

// Copyright (c) 2015 Rustcc Developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! `CoroutineContext`: an immutable mapping from element keys to elements
//! (spec §3). Two elements are recognized by the runtime itself, the
//! current `Job` and the current `Dispatcher`; anything else is an
//! opaque user-defined element.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::ops::Add;
use std::sync::Arc;

/// Marker for types that can live in a `CoroutineContext`.
///
/// Blanket-implemented for anything `'static + Send + Sync`; there is
/// nothing to opt into beyond those bounds, but the trait gives context
/// elements a name in signatures and documentation.
pub trait ContextElement: Any + Send + Sync {}

impl<T: Any + Send + Sync> ContextElement for T {}

/// An immutable, cheaply-cloneable mapping from element type to element
/// value.
///
/// Contexts compose by override-merge: `a.merge(&b)` (equivalently
/// `a + b`) produces a context where, for any key present in both, `b`'s
/// element wins (spec §3). The context captured by a suspending
/// operation is the one active when it suspended; callers are expected
/// to restore it around resumption (`coroutine.rs` does this once, at
/// the executor boundary, for every job).
#[derive(Clone, Default)]
pub struct CoroutineContext {
    elements: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl CoroutineContext {
    /// The empty context.
    pub fn empty() -> CoroutineContext {
        CoroutineContext::default()
    }

    /// Return a new context with `element` installed, overriding any
    /// existing element of the same type.
    pub fn with<E: ContextElement>(&self, element: E) -> CoroutineContext {
        let mut elements = (*self.elements).clone();
        elements.insert(TypeId::of::<E>(), Arc::new(element) as Arc<dyn Any + Send + Sync>);
        CoroutineContext {
            elements: Arc::new(elements),
        }
    }

    /// Look up the element of type `E`, if any.
    pub fn get<E: ContextElement>(&self) -> Option<Arc<E>> {
        self.elements
            .get(&TypeId::of::<E>())
            .cloned()
            .and_then(|value| (value as Arc<dyn Any + Send + Sync>).downcast::<E>().ok())
    }

    /// Override-merge: elements in `other` win over elements of the same
    /// type in `self`.
    pub fn merge(&self, other: &CoroutineContext) -> CoroutineContext {
        let mut elements = (*self.elements).clone();
        for (key, value) in other.elements.iter() {
            elements.insert(*key, value.clone());
        }
        CoroutineContext {
            elements: Arc::new(elements),
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl<E: ContextElement> Add<E> for CoroutineContext {
    type Output = CoroutineContext;

    fn add(self, element: E) -> CoroutineContext {
        self.with(element)
    }
}

impl Add<&CoroutineContext> for CoroutineContext {
    type Output = CoroutineContext;

    fn add(self, other: &CoroutineContext) -> CoroutineContext {
        self.merge(other)
    }
}

impl fmt::Debug for CoroutineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineContext")
            .field("elements", &self.elements.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct Name(&'static str);

    #[derive(Debug, PartialEq, Eq)]
    struct Count(u32);

    #[test]
    fn get_on_empty_context_is_none() {
        let ctx = CoroutineContext::empty();
        assert!(ctx.get::<Name>().is_none());
    }

    #[test]
    fn with_installs_and_get_retrieves() {
        let ctx = CoroutineContext::empty().with(Name("alice"));
        assert_eq!(*ctx.get::<Name>().unwrap(), Name("alice"));
    }

    #[test]
    fn merge_right_operand_wins_same_key() {
        let left = CoroutineContext::empty().with(Name("left"));
        let right = CoroutineContext::empty().with(Name("right"));
        let merged = left.merge(&right);
        assert_eq!(*merged.get::<Name>().unwrap(), Name("right"));
    }

    #[test]
    fn merge_is_additive_across_distinct_keys() {
        let left = CoroutineContext::empty().with(Name("left"));
        let right = CoroutineContext::empty().with(Count(1));
        let merged = left.merge(&right);
        assert_eq!(*merged.get::<Name>().unwrap(), Name("left"));
        assert_eq!(*merged.get::<Count>().unwrap(), Count(1));
    }

    #[test]
    fn add_operator_matches_with_and_merge() {
        let ctx = CoroutineContext::empty() + Name("alice");
        assert_eq!(*ctx.get::<Name>().unwrap(), Name("alice"));

        let other = CoroutineContext::empty().with(Count(2));
        let merged = ctx.clone() + &other;
        assert_eq!(*merged.get::<Name>().unwrap(), Name("alice"));
        assert_eq!(*merged.get::<Count>().unwrap(), Count(2));
    }
}
