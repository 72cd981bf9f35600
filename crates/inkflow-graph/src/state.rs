//! Typed workflow state.
//!
//! A state is a struct whose every field names a [`Reducer`]: the function
//! that folds a node's partial update into the current value. Nodes never
//! return a whole state, only an `Update` whose fields are all optional.
//! Both types are generated by [`graph_state!`](crate::graph_state).

use std::fmt::Debug;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Merge function for one state field, fixed at definition time.
pub trait Reducer {
    /// Type stored in the state.
    type Value: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static;
    /// Type a node supplies to change the field.
    type Update: Debug + Send + Serialize + DeserializeOwned + 'static;

    fn reduce(current: &mut Self::Value, update: Self::Update);
}

/// `merge(old, new) = new`.
pub struct Replace<T>(PhantomData<T>);

impl<T> Reducer for Replace<T>
where
    T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    type Value = T;
    type Update = T;

    fn reduce(current: &mut T, update: T) {
        *current = update;
    }
}

/// `merge(old, new) = old ++ new`, order preserved.
pub struct Append<T>(PhantomData<T>);

impl<T> Reducer for Append<T>
where
    T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    type Value = Vec<T>;
    type Update = Vec<T>;

    fn reduce(current: &mut Vec<T>, update: Vec<T>) {
        current.extend(update);
    }
}

/// A state type the executor can run: mergeable, snapshot-able, serializable.
pub trait GraphState:
    Clone + Debug + Default + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Partial update returned by nodes.
    type Update: Debug + Default + Send + Serialize + DeserializeOwned + 'static;

    /// Apply every present field through its reducer; returns the names of
    /// the fields that were present, in declaration order.
    fn merge(&mut self, update: Self::Update) -> Vec<&'static str>;

    fn field_names() -> &'static [&'static str];
}

/// Declare a state struct and its partial update struct.
///
/// ```ignore
/// graph_state! {
///     pub struct DraftState / DraftUpdate {
///         pub notes: Append<String> = Vec::new(),
///         pub draft: Replace<Option<String>> = None,
///     }
/// }
///
/// let update = DraftUpdate::default().notes(vec!["intro".into()]);
/// ```
///
/// The update gets one builder method per field. Deserializing an update
/// rejects unknown keys. Callers need `serde` as a dependency.
#[macro_export]
macro_rules! graph_state {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident / $update:ident {
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $field:ident : $reducer:ty = $default:expr
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, ::serde::Serialize, ::serde::Deserialize)]
        #[serde(default)]
        $vis struct $name {
            $(
                $(#[$fmeta])*
                $fvis $field: <$reducer as $crate::state::Reducer>::Value,
            )*
        }

        impl ::std::default::Default for $name {
            fn default() -> Self {
                Self {
                    $( $field: $default, )*
                }
            }
        }

        #[doc = concat!("Partial update of [`", stringify!($name), "`].")]
        #[derive(Debug, Default, ::serde::Serialize, ::serde::Deserialize)]
        #[serde(default, deny_unknown_fields)]
        $vis struct $update {
            $(
                #[serde(skip_serializing_if = "Option::is_none")]
                pub $field: ::std::option::Option<<$reducer as $crate::state::Reducer>::Update>,
            )*
        }

        #[allow(dead_code)]
        impl $update {
            $(
                pub fn $field(
                    mut self,
                    value: <$reducer as $crate::state::Reducer>::Update,
                ) -> Self {
                    self.$field = ::std::option::Option::Some(value);
                    self
                }
            )*
        }

        impl $crate::state::GraphState for $name {
            type Update = $update;

            fn merge(&mut self, update: $update) -> ::std::vec::Vec<&'static str> {
                let mut changed = ::std::vec::Vec::new();
                $(
                    if let ::std::option::Option::Some(value) = update.$field {
                        <$reducer as $crate::state::Reducer>::reduce(&mut self.$field, value);
                        changed.push(stringify!($field));
                    }
                )*
                changed
            }

            fn field_names() -> &'static [&'static str] {
                &[$( stringify!($field) ),*]
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Keeps the larger of the two values.
    struct Max;

    impl Reducer for Max {
        type Value = u32;
        type Update = u32;

        fn reduce(current: &mut u32, update: u32) {
            *current = (*current).max(update);
        }
    }

    graph_state! {
        struct Doc / DocUpdate {
            title: Replace<String> = "untitled".to_string(),
            sections: Append<String> = Vec::new(),
            score: Max = 0,
        }
    }

    #[test]
    fn test_defaults() {
        let doc = Doc::default();
        assert_eq!(doc.title, "untitled");
        assert!(doc.sections.is_empty());
        assert_eq!(Doc::field_names(), &["title", "sections", "score"]);
    }

    #[test]
    fn test_replace_keeps_last_write() {
        let mut doc = Doc::default();
        doc.merge(DocUpdate::default().title("first".into()));
        doc.merge(DocUpdate::default().title("second".into()));
        assert_eq!(doc.title, "second");
    }

    #[test]
    fn test_append_concatenates_in_order() {
        let mut doc = Doc::default();
        doc.merge(DocUpdate::default().sections(vec!["a".into(), "b".into()]));
        doc.merge(DocUpdate::default().sections(vec!["c".into()]));
        assert_eq!(doc.sections, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_custom_reducer() {
        let mut doc = Doc::default();
        doc.merge(DocUpdate::default().score(7));
        doc.merge(DocUpdate::default().score(3));
        assert_eq!(doc.score, 7);
    }

    #[test]
    fn test_merge_reports_present_fields_only() {
        let mut doc = Doc::default();
        let changed = doc.merge(DocUpdate::default().score(1).title("t".into()));
        assert_eq!(changed, vec!["title", "score"]);
        assert!(doc.merge(DocUpdate::default()).is_empty());
    }

    #[test]
    fn test_update_rejects_unknown_keys() {
        let ok: DocUpdate = serde_json::from_value(serde_json::json!({"title": "x"})).unwrap();
        assert_eq!(ok.title.as_deref(), Some("x"));
        assert!(ok.sections.is_none());

        let err = serde_json::from_value::<DocUpdate>(serde_json::json!({"titel": "x"}));
        assert!(err.is_err());
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut doc = Doc::default();
        doc.merge(DocUpdate::default().sections(vec!["a".into()]).score(4));
        let value = serde_json::to_value(&doc).unwrap();
        let back: Doc = serde_json::from_value(value).unwrap();
        assert_eq!(back.sections, vec!["a"]);
        assert_eq!(back.score, 4);
    }
}
