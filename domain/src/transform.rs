//! Domain filtering applied to items on the list path.

use crate::{Item, Nested};

/// Nested documents with this name prefix are hidden from readers.
pub const DEPRECATED_PREFIX: &str = "deprecated_";
/// Atoms with this name prefix are hidden from readers.
pub const DELETED_PREFIX: &str = "deleted_";

/// Drop deprecated nested documents and deleted atoms.
///
/// Takes the item by value so concurrent calls never share state. Never
/// fails; filtering everything out leaves an empty `related`.
pub fn transform(mut item: Item) -> Item {
    item.related.retain(|nst| !nst.name.starts_with(DEPRECATED_PREFIX));
    for nst in &mut item.related {
        nst.related.retain(|atom| !atom.name.starts_with(DELETED_PREFIX));
    }
    item
}

/// Order nested documents by `sort`, highest first. Ties keep no particular order.
pub fn sort_related_desc(related: &mut [Nested]) {
    related.sort_unstable_by(|a, b| b.sort.cmp(&a.sort));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Atom;
    use uuid::Uuid;

    fn atom(name: &str) -> Atom {
        Atom {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }

    fn nested(name: &str, sort: i64, atoms: Vec<Atom>) -> Nested {
        Nested {
            id: Uuid::new_v4(),
            name: name.into(),
            sort,
            related: atoms,
        }
    }

    fn names(item: &Item) -> Vec<(String, Vec<String>)> {
        item.related
            .iter()
            .map(|n| {
                (
                    n.name.clone(),
                    n.related.iter().map(|a| a.name.clone()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn drops_deprecated_nested_and_deleted_atoms() {
        let mut item = Item::new("it", 1);
        item.related = vec![
            nested("deprecated_x", 0, vec![atom("a")]),
            nested("keep", 0, vec![atom("deleted_y"), atom("z")]),
        ];

        let out = transform(item);
        assert_eq!(names(&out), vec![("keep".to_string(), vec!["z".to_string()])]);
    }

    #[test]
    fn everything_filtered_leaves_empty_related() {
        let mut item = Item::new("it", 1);
        item.related = vec![
            nested("deprecated_a", 0, vec![]),
            nested("deprecated_b", 0, vec![]),
        ];
        let out = transform(item);
        assert!(out.related.is_empty());

        let mut item = Item::new("it", 1);
        item.related = vec![nested("n", 0, vec![atom("deleted_1"), atom("deleted_2")])];
        let out = transform(item);
        assert_eq!(out.related.len(), 1);
        assert!(out.related[0].related.is_empty());
    }

    #[test]
    fn prefix_must_be_at_the_start() {
        let mut item = Item::new("it", 1);
        item.related = vec![
            nested("not_deprecated_", 0, vec![atom("x_deleted_"), atom("Deleted_cap")]),
            nested("Deprecated_cap", 0, vec![]),
        ];
        let out = transform(item.clone());
        assert_eq!(out, item);
    }

    #[test]
    fn applying_twice_equals_applying_once() {
        let mut item = Item::new("it", 1);
        item.related = vec![
            nested("deprecated_old", 3, vec![atom("a")]),
            nested("live", 2, vec![atom("deleted_b"), atom("c"), atom("deleted_d")]),
            nested("other", 9, vec![atom("e")]),
        ];
        let once = transform(item);
        let twice = transform(once.clone());
        assert_eq!(once, twice);
        assert!(once
            .related
            .iter()
            .all(|n| !n.name.starts_with(DEPRECATED_PREFIX)
                && n.related.iter().all(|a| !a.name.starts_with(DELETED_PREFIX))));
        assert_eq!(once.related.len(), 2);
        assert_eq!(once.related[0].related.len(), 1);
    }

    #[test]
    fn sorts_related_descending() {
        let mut related = vec![
            nested("a", 1, vec![]),
            nested("b", 30, vec![]),
            nested("c", -4, vec![]),
            nested("d", 7, vec![]),
            nested("e", i64::MIN, vec![]),
            nested("f", i64::MAX, vec![]),
        ];
        sort_related_desc(&mut related);
        let sorts: Vec<i64> = related.iter().map(|n| n.sort).collect();
        assert_eq!(sorts, vec![i64::MAX, 30, 7, 1, -4, i64::MIN]);
    }
}
