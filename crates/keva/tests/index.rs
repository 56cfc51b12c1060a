mod common;

use common::{Person, person, store};
use keva::{Collection, CollectionOptions, IndexQuery, Key, KeyPart, PutOptions, RangeQuery, Record, Store};

fn indexed_people(store: &Store) -> Collection<Person> {
    let mut coll = store
        .collection_opts(
            "people",
            CollectionOptions::new()
                .key_func(|p: &Person| p.name.clone())
                .derived_keys(true),
        )
        .unwrap();
    coll.add_index("age", |p: &Person| p.age).unwrap();
    coll.add_index("name_age", |p: &Person| (p.name.clone(), p.age))
        .unwrap();
    coll
}

/// Every index entry must equal what the index function derives from the
/// records currently stored.
fn assert_consistent(coll: &Collection<Person>) {
    let records: Vec<(Key, Person)> = coll
        .items(RangeQuery::new())
        .collect::<keva::Result<_>>()
        .unwrap();

    for (index_name, func) in [
        ("age", Box::new(|p: &Person| Key::from(p.age)) as Box<dyn Fn(&Person) -> Key>),
        ("name_age", Box::new(|p: &Person| Key::from((p.name.clone(), p.age)))),
    ] {
        let mut expected: Vec<(Key, Key)> = records
            .iter()
            .map(|(key, value)| (func(value), key.clone()))
            .collect();
        expected.sort();

        let index = coll.index(index_name).unwrap();
        let actual: Vec<(Key, Key)> = index
            .pairs(IndexQuery::new())
            .collect::<keva::Result<_>>()
            .unwrap();
        assert_eq!(actual, expected, "index '{index_name}' diverged");
    }
}

#[test]
fn entries_track_every_mutation() {
    let store = store();
    let people = indexed_people(&store);

    people.put(person("ada", 36)).unwrap();
    people.put(person("bob", 41)).unwrap();
    people.put(person("cyd", 23)).unwrap();
    assert_consistent(&people);

    let mut rec = people.get_record("bob").unwrap().unwrap();
    rec.data.age = 42;
    people.put(rec).unwrap();
    assert_consistent(&people);

    let mut rec = people.get_record("cyd").unwrap().unwrap();
    rec.data.name = "cydney".into();
    people.put(rec).unwrap();
    assert_consistent(&people);

    people.delete("ada").unwrap();
    assert_consistent(&people);
}

#[test]
fn pairs_iterate_in_tuple_order() {
    let store = store();
    let people = indexed_people(&store);
    people.put(person("ada", 36)).unwrap();
    people.put(person("bob", 23)).unwrap();
    people.put(person("cyd", 41)).unwrap();

    let age = people.index("age").unwrap();
    let pairs: Vec<(Key, Key)> = age
        .pairs(IndexQuery::new())
        .collect::<keva::Result<_>>()
        .unwrap();
    assert_eq!(
        pairs,
        vec![
            (Key::from(23i64), Key::from("bob")),
            (Key::from(36i64), Key::from("ada")),
            (Key::from(41i64), Key::from("cyd")),
        ]
    );

    let tuples: Vec<Key> = age
        .tuples(IndexQuery::new().reverse())
        .collect::<keva::Result<_>>()
        .unwrap();
    assert_eq!(
        tuples,
        vec![Key::from(41i64), Key::from(36i64), Key::from(23i64)]
    );

    let keys: Vec<Key> = age
        .keys(IndexQuery::new().max(2))
        .collect::<keva::Result<_>>()
        .unwrap();
    assert_eq!(keys, vec![Key::from("bob"), Key::from("ada")]);
}

#[test]
fn duplicate_tuples_order_by_primary_key() {
    let store = store();
    let people = indexed_people(&store);
    people.put(person("zoe", 30)).unwrap();
    people.put(person("amy", 30)).unwrap();

    let age = people.index("age").unwrap();
    let pairs: Vec<(Key, Key)> = age
        .pairs(IndexQuery::new())
        .collect::<keva::Result<_>>()
        .unwrap();
    assert_eq!(
        pairs,
        vec![
            (Key::from(30i64), Key::from("amy")),
            (Key::from(30i64), Key::from("zoe")),
        ]
    );
}

#[test]
fn args_scopes_both_directions_to_the_prefix() {
    let store = store();
    let people = indexed_people(&store);
    people.put(person("ada", 36)).unwrap();
    people.put(person("ada", 36)).unwrap(); // same derived key, idempotent
    people.put(person("bob", 23)).unwrap();
    people.put(person("bo", 51)).unwrap();

    let name_age = people.index("name_age").unwrap();

    let forward: Vec<Key> = name_age
        .tuples(IndexQuery::new().args(("bob",)))
        .collect::<keva::Result<_>>()
        .unwrap();
    assert_eq!(forward, vec![Key::from(("bob", 23i64))]);

    // "bo" must not swallow "bob": prefix scoping is per tuple element,
    // not per byte.
    let bo: Vec<Key> = name_age
        .tuples(IndexQuery::new().args(("bo",)))
        .collect::<keva::Result<_>>()
        .unwrap();
    assert_eq!(bo, vec![Key::from(("bo", 51i64))]);

    let reverse: Vec<Key> = name_age
        .tuples(IndexQuery::new().args(("ada",)).reverse())
        .collect::<keva::Result<_>>()
        .unwrap();
    assert_eq!(reverse, vec![Key::from(("ada", 36i64))]);
}

#[test]
fn standalone_bounds_follow_the_include_rule() {
    let store = store();
    let people = indexed_people(&store);
    for (name, age) in [("a", 10i64), ("b", 20), ("c", 30), ("d", 40)] {
        people.put(person(name, age)).unwrap();
    }
    let age = people.index("age").unwrap();

    let tuples = |query: IndexQuery<'_>| -> Vec<i64> {
        age.tuples(query)
            .map(|t| match t.unwrap().parts() {
                [KeyPart::Int(v)] => *v,
                other => panic!("unexpected tuple {other:?}"),
            })
            .collect()
    };

    assert_eq!(tuples(IndexQuery::new().lo(20i64)), vec![20, 30, 40]);
    // Exclusive hi drops the bound tuple's own entries...
    assert_eq!(tuples(IndexQuery::new().hi(30i64)), vec![10, 20]);
    // ...include widens it to the bound tuple and its extensions.
    assert_eq!(tuples(IndexQuery::new().hi(30i64).include()), vec![10, 20, 30]);
    assert_eq!(
        tuples(IndexQuery::new().hi(30i64).include().reverse()),
        vec![30, 20, 10]
    );
    assert_eq!(tuples(IndexQuery::new().hi(30i64).reverse()), vec![20, 10]);
    assert_eq!(
        tuples(IndexQuery::new().lo(20i64).hi(40i64).reverse()),
        vec![30, 20]
    );
}

#[test]
fn items_resolve_records_and_skip_stale_entries() {
    common::init();
    let store = store();
    let mut people = store
        .collection_opts(
            "people",
            CollectionOptions::new()
                .key_func(|p: &Person| p.name.clone())
                .derived_keys(true),
        )
        .unwrap();
    people.add_index("age", |p: &Person| p.age).unwrap();

    people.put(person("ada", 36)).unwrap();
    people.put(person("bob", 41)).unwrap();

    // Blind-replace ada's record with a different age, leaving the old
    // age entry in place, then delete the record: the old entry is stale.
    people
        .put_opts(
            Record::new(person("ada", 99)),
            PutOptions {
                blind: true,
                ..PutOptions::default()
            },
        )
        .unwrap();
    people.delete("ada").unwrap();

    let age = people.index("age").unwrap();
    // The stale entry still exists at the raw level...
    assert_eq!(age.count(IndexQuery::new()).unwrap(), 2);
    // ...but items() warns, skips it, and serves the live record.
    let items: Vec<(Key, Person)> = age
        .items(IndexQuery::new())
        .collect::<keva::Result<_>>()
        .unwrap();
    assert_eq!(items, vec![(Key::from("bob"), person("bob", 41))]);
}

#[test]
fn find_get_has_and_count_answer_point_queries() {
    let store = store();
    let people = indexed_people(&store);
    people.put(person("ada", 36)).unwrap();
    people.put(person("bob", 23)).unwrap();

    let age = people.index("age").unwrap();
    assert_eq!(age.find(IndexQuery::new()).unwrap(), Some(person("bob", 23)));
    assert_eq!(
        age.find(IndexQuery::new().reverse()).unwrap(),
        Some(person("ada", 36))
    );
    assert_eq!(age.get(36i64).unwrap(), Some(person("ada", 36)));
    assert_eq!(age.get(99i64).unwrap(), None);
    assert_eq!(
        age.gets([23i64, 99, 36]).unwrap(),
        vec![Some(person("bob", 23)), None, Some(person("ada", 36))]
    );
    assert!(age.has(23i64).unwrap());
    assert!(!age.has(24i64).unwrap());
    assert_eq!(age.count(IndexQuery::new()).unwrap(), 2);
    assert_eq!(age.count(IndexQuery::new().lo(30i64)).unwrap(), 1);

    // `has` is exact: a composite index only holds 2-tuples, so a bare
    // 1-tuple prefix does not count as present.
    let name_age = people.index("name_age").unwrap();
    assert!(name_age.has(("ada", 36i64)).unwrap());
    assert!(!name_age.has(("ada",)).unwrap());
    // ...while `get` accepts the prefix form.
    assert_eq!(
        name_age.get(("ada",)).unwrap(),
        Some(person("ada", 36))
    );
}

#[test]
fn list_returns_fan_out_into_multiple_entries() {
    let store = store();
    let mut notes = store.collection::<Vec<String>>("notes").unwrap();
    notes
        .add_index("word", |words: &Vec<String>| {
            words.iter().map(|w| Key::from(w.clone())).collect::<Vec<Key>>()
        })
        .unwrap();

    notes
        .put(vec!["red".to_owned(), "green".to_owned()])
        .unwrap();
    notes.put(vec!["green".to_owned()]).unwrap();
    notes.put(Vec::new()).unwrap();

    let word = notes.index("word").unwrap();
    let pairs: Vec<(Key, Key)> = word
        .pairs(IndexQuery::new())
        .collect::<keva::Result<_>>()
        .unwrap();
    assert_eq!(
        pairs,
        vec![
            (Key::from("green"), Key::from(1i64)),
            (Key::from("green"), Key::from(2i64)),
            (Key::from("red"), Key::from(1i64)),
        ]
    );

    // Updating a record retracts exactly the entries it no longer yields.
    let mut rec = notes.get_record(1i64).unwrap().unwrap();
    rec.data = vec!["blue".to_owned()];
    notes.put(rec).unwrap();
    let tuples: Vec<Key> = word
        .tuples(IndexQuery::new())
        .collect::<keva::Result<_>>()
        .unwrap();
    assert_eq!(
        tuples,
        vec![Key::from("blue"), Key::from("green")]
    );
}

#[test]
fn optional_returns_contribute_nothing_when_none() {
    let store = store();
    let mut people = store.collection::<Person>("people").unwrap();
    people
        .add_index("adult_age", |p: &Person| {
            (p.age >= 18).then_some(p.age)
        })
        .unwrap();

    people.put(person("kid", 9)).unwrap();
    people.put(person("ada", 36)).unwrap();

    let adult = people.index("adult_age").unwrap();
    let tuples: Vec<Key> = adult
        .tuples(IndexQuery::new())
        .collect::<keva::Result<_>>()
        .unwrap();
    assert_eq!(tuples, vec![Key::from(36i64)]);
}

#[test]
fn index_metadata_is_registered_per_collection() {
    let store = store();
    let people = indexed_people(&store);
    let age = people.index("age").unwrap();
    assert_eq!(age.info().index_for.as_deref(), Some("people"));
    assert!(age.info().idx >= 10);
    assert!(people.index("nope").is_none());
}
