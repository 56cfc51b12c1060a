mod common;

use common::{Person, person, store};
use keva::{BatchOptions, Collection, Key, RangeQuery, Store};

fn seeded(n: i64) -> (Store, Collection<Person>) {
    let store = store();
    let people = store.collection::<Person>("people").unwrap();
    for i in 1..=n {
        people.put(person(&format!("p{i}"), i)).unwrap();
    }
    (store, people)
}

#[test]
fn exact_bounds_yield_zero_or_one_entries() {
    let (_store, people) = seeded(5);

    let query = RangeQuery::new();
    let mut cur = people.cursor(&query);
    cur.set_exact(Key::from(3i64));
    assert!(cur.step().unwrap());
    assert_eq!(cur.key(), &Key::from(3i64));
    assert!(!cur.step().unwrap(), "an exact scan never yields twice");

    let mut cur = people.cursor(&query);
    cur.set_exact(Key::from(99i64));
    assert!(!cur.step().unwrap());
}

#[test]
fn a_spent_cursor_stays_spent() {
    let (_store, people) = seeded(2);
    let query = RangeQuery::new();
    let mut cur = people.cursor(&query);
    assert!(cur.step().unwrap());
    assert!(cur.step().unwrap());
    assert!(!cur.step().unwrap());
    assert!(!cur.step().unwrap());
}

#[test]
fn the_cursor_view_is_overwritten_by_each_step() {
    let (_store, people) = seeded(3);
    let query = RangeQuery::new();
    let mut cur = people.cursor(&query);

    assert!(cur.step().unwrap());
    let first = cur.key().clone();
    let first_data = cur.data().to_vec();
    assert!(cur.step().unwrap());
    // The borrow rules force the copy above; the buffers really did move on.
    assert_ne!(cur.key(), &first);
    assert_ne!(cur.data(), first_data.as_slice());
}

#[test]
fn max_limits_logical_results_across_batches() {
    let (_store, people) = seeded(6);
    people
        .batch(BatchOptions {
            max_recs: Some(3),
            ..BatchOptions::default()
        })
        .unwrap();

    let query = RangeQuery::new();
    let mut cur = people.cursor(&query);
    cur.set_max(4);
    let mut seen = Vec::new();
    while cur.step().unwrap() {
        seen.push(cur.key().clone());
    }
    assert_eq!(
        seen,
        (1..=4).map(Key::from).collect::<Vec<_>>(),
        "the cap counts logical records, not physical ones"
    );
}

#[test]
fn max_phys_limits_engine_fetches_not_logical_yields() {
    let (_store, people) = seeded(6);
    people
        .batch(BatchOptions {
            max_recs: Some(3),
            ..BatchOptions::default()
        })
        .unwrap();

    let query = RangeQuery::new();
    let mut cur = people.cursor(&query);
    cur.set_max_phys(1);
    let mut seen = 0;
    while cur.step().unwrap() {
        seen += 1;
    }
    assert_eq!(seen, 3, "one physical record carries a whole batch");
}

#[test]
fn intra_batch_order_follows_the_scan_direction() {
    let (_store, people) = seeded(4);
    people
        .batch(BatchOptions {
            max_recs: Some(4),
            ..BatchOptions::default()
        })
        .unwrap();

    let query = RangeQuery::new();
    let mut cur = people.cursor(&query);
    let mut forward = Vec::new();
    while cur.step().unwrap() {
        assert!(cur.is_batch());
        forward.push((cur.index(), cur.key().clone()));
    }
    assert_eq!(
        forward.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );

    let query = RangeQuery::new().reverse();
    let mut cur = people.cursor(&query);
    let mut reverse = Vec::new();
    while cur.step().unwrap() {
        reverse.push((cur.index(), cur.key().clone()));
    }
    assert_eq!(
        reverse.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
        vec![3, 2, 1, 0]
    );

    let mut keys_fwd: Vec<Key> = forward.into_iter().map(|(_, k)| k).collect();
    keys_fwd.reverse();
    assert_eq!(keys_fwd, reverse.into_iter().map(|(_, k)| k).collect::<Vec<_>>());
}

#[test]
fn batch_keys_expose_the_reversed_physical_key_list() {
    let (_store, people) = seeded(3);
    people
        .batch(BatchOptions {
            max_recs: Some(3),
            ..BatchOptions::default()
        })
        .unwrap();

    let query = RangeQuery::new();
    let mut cur = people.cursor(&query);
    assert!(cur.step().unwrap());
    // Highest key first in the physical entry; the logical view re-orders.
    assert_eq!(
        cur.keys(),
        &[Key::from(3i64), Key::from(2i64), Key::from(1i64)]
    );
    assert_eq!(cur.key(), &Key::from(1i64));
}

#[test]
fn open_lower_bounds_skip_the_bound_itself() {
    let (_store, people) = seeded(4);

    let query = RangeQuery::new();
    let mut cur = people.cursor(&query);
    cur.set_lo(Key::from(2i64), false);
    let mut seen = Vec::new();
    while cur.step().unwrap() {
        seen.push(cur.key().clone());
    }
    assert_eq!(seen, vec![Key::from(3i64), Key::from(4i64)]);
}

#[test]
fn reverse_scan_of_the_last_collection_handles_the_prefix_edge() {
    // A reverse scan with no upper bound seeks past the collection's
    // prefix; the first engine step may land outside it and must be
    // retried, not treated as emptiness.
    let (_store, people) = seeded(3);
    let query = RangeQuery::new().reverse();
    let keys: Vec<Key> = people
        .keys(query)
        .collect::<keva::Result<_>>()
        .unwrap();
    assert_eq!(
        keys,
        vec![Key::from(3i64), Key::from(2i64), Key::from(1i64)]
    );
}
