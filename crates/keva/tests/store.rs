mod common;

use common::{Person, person, store};
use keva::error::Error;
use keva::{Key, Packer, Store};
use std::rc::Rc;

#[test]
fn open_rejects_unknown_engine_names() {
    assert!(matches!(
        keva::open("paxos-over-carrier-pigeon"),
        Err(Error::UnknownEngine(_))
    ));
}

#[test]
fn counters_start_at_init_and_return_the_previous_value() {
    let store = store();
    assert_eq!(store.count("jobs").unwrap(), 1);
    assert_eq!(store.count("jobs").unwrap(), 2);
    assert_eq!(store.count("jobs").unwrap(), 3);

    assert_eq!(store.count_opts("offsets", 100, 50, None).unwrap(), 50);
    assert_eq!(store.count_opts("offsets", 1, 50, None).unwrap(), 150);
}

#[test]
fn zero_delta_reads_without_creating_or_advancing() {
    let store = store();
    // Reading an absent counter reports init without writing it.
    assert_eq!(store.count_opts("lazy", 0, 7, None).unwrap(), 7);
    assert_eq!(store.count_opts("lazy", 1, 7, None).unwrap(), 7);
    assert_eq!(store.count_opts("lazy", 0, 7, None).unwrap(), 8);
    assert_eq!(store.count_opts("lazy", 0, 7, None).unwrap(), 8);
}

#[test]
fn counter_sequences_are_gapless_per_name() {
    let store = store();
    let seq: Vec<i64> = (0..20).map(|_| store.count("seq").unwrap()).collect();
    let expected: Vec<i64> = (1..=20).collect();
    assert_eq!(seq, expected);
    // Another name runs independently.
    assert_eq!(store.count("other").unwrap(), 1);
}

#[test]
fn counters_survive_reopening_the_store() {
    let store = store();
    let engine = store.engine();
    assert_eq!(store.count("epoch").unwrap(), 1);
    assert_eq!(store.count("epoch").unwrap(), 2);

    let reopened = Store::new(engine);
    assert_eq!(reopened.count("epoch").unwrap(), 3);
}

#[test]
fn collection_indices_are_stable_across_reopens() {
    let store = store();
    let engine = store.engine();
    let people = store.collection::<Person>("people").unwrap();
    let towns = store.collection::<Person>("towns").unwrap();
    assert_eq!(people.info().idx, 10);
    assert_eq!(towns.info().idx, 11);

    let reopened = Store::new(engine);
    let people_again = reopened.collection::<Person>("people").unwrap();
    assert_eq!(people_again.info().idx, 10);
}

#[test]
fn collections_do_not_see_each_other_records() {
    let store = store();
    let people = store.collection::<Person>("people").unwrap();
    let towns = store.collection::<Person>("towns").unwrap();
    people.put(person("ada", 36)).unwrap();

    assert_eq!(towns.keys(keva::RangeQuery::new()).count(), 0);
    assert_eq!(people.keys(keva::RangeQuery::new()).count(), 1);
}

///
/// ZigPacker
///
/// Toy compressor with a stable registered name.
///

struct ZigPacker;

impl Packer for ZigPacker {
    fn name(&self) -> &str {
        "z"
    }

    fn pack(&self, data: &[u8]) -> keva::Result<Vec<u8>> {
        let mut out = vec![0x5A];
        out.extend_from_slice(data);
        Ok(out)
    }

    fn unpack(&self, data: &[u8]) -> keva::Result<Vec<u8>> {
        Ok(data[1..].to_vec())
    }
}

#[test]
fn encoder_registration_is_idempotent_and_persistent() {
    let store = store();
    let engine = store.engine();

    let byte = store.add_encoder(Rc::new(ZigPacker)).unwrap();
    assert!(byte >= 10, "user encoders start past the built-ins");
    assert_eq!(store.add_encoder(Rc::new(ZigPacker)).unwrap(), byte);
    assert_eq!(store.get_encoder(byte).unwrap().name(), "z");

    // A fresh store over the same engine reads the same assignment back.
    let reopened = Store::new(engine);
    assert_eq!(reopened.add_encoder(Rc::new(ZigPacker)).unwrap(), byte);
    assert_eq!(reopened.get_encoder(byte).unwrap().name(), "z");
}

#[test]
fn unknown_encoder_reads_blame_the_persisted_name() {
    let store = store();
    let engine = store.engine();
    let byte = store.add_encoder(Rc::new(ZigPacker)).unwrap();

    let coll = store.collection::<Person>("people").unwrap();
    coll.put_opts(
        keva::Record::new(person("ada", 36)),
        keva::PutOptions {
            packer: Some(Rc::new(ZigPacker)),
            ..keva::PutOptions::default()
        },
    )
    .unwrap();

    // Reopen without re-registering "z": the read must fail descriptively.
    let reopened = Store::new(engine);
    let coll = reopened.collection::<Person>("people").unwrap();
    let err = coll.get(Key::from(1i64)).unwrap_err();
    match err {
        Error::UnknownEncoder { prefix, name } => {
            assert_eq!(prefix, byte);
            assert_eq!(name.as_deref(), Some("z"));
        }
        other => panic!("expected UnknownEncoder, got {other}"),
    }
}

#[test]
fn distinct_encoder_names_get_distinct_bytes() {
    struct Named(&'static str);
    impl Packer for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn pack(&self, data: &[u8]) -> keva::Result<Vec<u8>> {
            Ok(data.to_vec())
        }
        fn unpack(&self, data: &[u8]) -> keva::Result<Vec<u8>> {
            Ok(data.to_vec())
        }
    }

    let store = store();
    let a = store.add_encoder(Rc::new(Named("alpha"))).unwrap();
    let b = store.add_encoder(Rc::new(Named("beta"))).unwrap();
    assert_ne!(a, b);
}
