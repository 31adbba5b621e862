//! Keyed dispatch: dependency ordering, cycle reporting, sort policies.

mod common;

use common::{init_tracing, CallLog};
use sigorder::{
    DeferredSortedSignal, DispatcherConfig, DisconnectToken, EmitError, KeyedDispatch,
    SortPolicy, SortedSignal,
};

fn record<D: KeyedDispatch<&'static str, ()>>(
    dispatcher: &mut D,
    key: &'static str,
    log: &CallLog<&'static str>,
) -> DisconnectToken {
    let log = log.clone();
    dispatcher.connect(key, move |_: &()| {
        log.push(key);
        Ok(())
    })
}

fn position(order: &[&'static str], key: &str) -> usize {
    order
        .iter()
        .position(|k| *k == key)
        .unwrap_or_else(|| panic!("{key} missing from {order:?}"))
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

fn dependencies_decide_the_order<D: KeyedDispatch<&'static str, ()>>() {
    init_tracing();
    let mut dispatcher = D::with_config(DispatcherConfig::default());
    let log = CallLog::new();

    let _c = record(&mut dispatcher, "c", &log);
    let _b = record(&mut dispatcher, "b", &log);
    let _a = record(&mut dispatcher, "a", &log);
    dispatcher.add_dependency("a", "c").unwrap();
    dispatcher.add_dependency("b", "a").unwrap();

    dispatcher.emit(&()).unwrap();
    assert_eq!(log.take(), vec!["b", "a", "c"]);
}

#[test]
fn fast_dependencies_decide_the_order() {
    dependencies_decide_the_order::<SortedSignal<&'static str, ()>>();
}

#[test]
fn deferred_dependencies_decide_the_order() {
    dependencies_decide_the_order::<DeferredSortedSignal<&'static str, ()>>();
}

#[test]
fn dependency_on_unknown_key_waits_for_that_key() {
    let mut signal = SortedSignal::<&'static str, ()>::new();
    let log = CallLog::new();
    let _late = record(&mut signal, "late", &log);
    signal.add_dependency("early", "late").unwrap();

    signal.emit(&()).unwrap();
    assert_eq!(log.take(), vec!["late"]);

    let _early = record(&mut signal, "early", &log);
    signal.emit(&()).unwrap();
    assert_eq!(log.take(), vec!["early", "late"]);
}

#[test]
fn slots_within_a_key_follow_their_registry() {
    let mut signal = SortedSignal::<&'static str, ()>::new();
    let log = CallLog::new();
    let _first = record(&mut signal, "k", &log);
    let second_log = log.clone();
    let _second = signal.connect("k", move |_| {
        second_log.push("k2");
        Ok(())
    });

    signal.emit(&()).unwrap();
    assert_eq!(log.take(), vec!["k", "k2"]);
}

#[test]
fn sorting_twice_is_stable() {
    let mut signal = SortedSignal::<&'static str, ()>::new();
    let log = CallLog::new();
    let _tokens: Vec<_> = ["e", "d", "c", "b", "a"]
        .into_iter()
        .map(|key| record(&mut signal, key, &log))
        .collect();
    signal.add_dependency("a", "d").unwrap();
    signal.add_dependency("c", "b").unwrap();
    signal.add_dependency("b", "e").unwrap();

    signal.sort().unwrap();
    let first: Vec<&str> = signal.sorted_keys().into_iter().copied().collect();
    signal.sort().unwrap();
    let second: Vec<&str> = signal.sorted_keys().into_iter().copied().collect();
    assert_eq!(first, second);

    assert!(position(&first, "a") < position(&first, "d"));
    assert!(position(&first, "c") < position(&first, "b"));
    assert!(position(&first, "b") < position(&first, "e"));
}

#[test]
fn removing_a_dependency_resorts() {
    let mut signal = SortedSignal::<&'static str, ()>::new();
    let log = CallLog::new();
    let _a = record(&mut signal, "a", &log);
    let _b = record(&mut signal, "b", &log);
    signal.add_dependency("b", "a").unwrap();
    assert_eq!(signal.sorted_keys(), vec![&"b", &"a"]);

    signal.remove_dependency(&"b", &"a").unwrap();
    assert_eq!(signal.sorted_keys(), vec![&"a", &"b"]);
}

#[test]
fn deep_chain_sorts_without_recursion() {
    let config = DispatcherConfig::default()
        .with_sort_policy(SortPolicy::Manual)
        .with_group_capacity(10_000);
    let mut signal = SortedSignal::<u32, ()>::with_config(config);
    let _tokens: Vec<_> = (0..10_000u32)
        .rev()
        .map(|key| signal.connect(key, |_| Ok(())))
        .collect();
    for key in 1..10_000u32 {
        signal.add_dependency(key - 1, key).unwrap();
    }

    signal.sort().unwrap();
    let order: Vec<u32> = signal.sorted_keys().into_iter().copied().collect();
    assert_eq!(order, (0..10_000).collect::<Vec<_>>());
}

// ---------------------------------------------------------------------------
// Cycles
// ---------------------------------------------------------------------------

#[test]
fn self_dependency_fails_the_sort() {
    init_tracing();
    let mut signal = SortedSignal::<&'static str, ()>::new();
    let log = CallLog::new();
    let _a = record(&mut signal, "a", &log);

    let err = signal.add_dependency("a", "a").unwrap_err();
    assert_eq!(err.chain(), &["a", "a"]);
    assert!(signal.sort().is_err());
}

#[test]
fn three_key_cycle_reports_every_member() {
    let mut signal = SortedSignal::<&'static str, ()>::new();
    let log = CallLog::new();
    let _a = record(&mut signal, "a", &log);
    let _b = record(&mut signal, "b", &log);
    let _c = record(&mut signal, "c", &log);
    signal.add_dependency("a", "c").unwrap();
    signal.add_dependency("b", "a").unwrap();

    let err = signal.add_dependency("c", "b").unwrap_err();
    let chain = err.chain();
    for key in ["a", "b", "c"] {
        assert!(chain.contains(&key), "{key} missing from {chain:?}");
    }
    assert_eq!(chain.first(), chain.last());
}

#[test]
fn failed_sort_fires_nothing_until_fixed() {
    let mut signal = SortedSignal::<&'static str, ()>::new();
    let log = CallLog::new();
    let _a = record(&mut signal, "a", &log);
    let _b = record(&mut signal, "b", &log);
    signal.add_dependency("a", "b").unwrap();
    assert!(signal.add_dependency("b", "a").is_err());

    signal.emit(&()).unwrap();
    assert!(log.take().is_empty());
    assert!(signal.sorted_keys().is_empty());

    signal.remove_dependency(&"b", &"a").unwrap();
    signal.emit(&()).unwrap();
    assert_eq!(log.take(), vec!["a", "b"]);
}

#[test]
fn clearing_dependencies_breaks_a_cycle() {
    let mut signal = SortedSignal::<&'static str, ()>::new();
    let log = CallLog::new();
    let _a = record(&mut signal, "a", &log);
    let _b = record(&mut signal, "b", &log);
    signal.add_dependency("a", "b").unwrap();
    assert!(signal.add_dependency("b", "a").is_err());

    signal.clear_dependencies(&"a").unwrap();
    signal.emit(&()).unwrap();
    assert_eq!(log.take(), vec!["a", "b"]);
}

// ---------------------------------------------------------------------------
// Sort policy
// ---------------------------------------------------------------------------

#[test]
fn manual_policy_batches_mutations_behind_one_sort() {
    let config = DispatcherConfig::default().with_sort_policy(SortPolicy::Manual);
    let mut signal = SortedSignal::<&'static str, ()>::with_config(config);
    let log = CallLog::new();
    let _a = record(&mut signal, "a", &log);
    let _b = record(&mut signal, "b", &log);
    signal.add_dependency("b", "a").unwrap();
    signal.add_dependency("a", "a").unwrap();

    signal.emit(&()).unwrap();
    assert!(log.take().is_empty());

    assert!(signal.sort().is_err());
    signal.remove_dependency(&"a", &"a").unwrap();
    signal.sort().unwrap();
    signal.emit(&()).unwrap();
    assert_eq!(log.take(), vec!["b", "a"]);
}

#[test]
fn explicit_policy_overrides_the_default() {
    let mut signal = SortedSignal::<&'static str, ()>::new();
    let log = CallLog::new();
    let _a = record(&mut signal, "a", &log);
    let _b = record(&mut signal, "b", &log);
    signal
        .add_dependency_with("b", "a", SortPolicy::Manual)
        .unwrap();
    assert!(!signal.is_sorted());

    signal.emit(&()).unwrap();
    assert!(log.take().is_empty());
}

fn reserve_registers_the_key<D: KeyedDispatch<&'static str, ()> + Default>() {
    let mut dispatcher = D::default();
    let log = CallLog::new();
    dispatcher.reserve("physics", 16);
    dispatcher.add_dependency("input", "physics").unwrap();

    let _physics = record(&mut dispatcher, "physics", &log);
    let _input = record(&mut dispatcher, "input", &log);
    dispatcher.emit(&()).unwrap();
    assert_eq!(log.take(), vec!["input", "physics"]);
}

#[test]
fn fast_reserve_registers_the_key() {
    reserve_registers_the_key::<SortedSignal<&'static str, ()>>();
}

#[test]
fn deferred_reserve_registers_the_key() {
    reserve_registers_the_key::<DeferredSortedSignal<&'static str, ()>>();
}

// ---------------------------------------------------------------------------
// Disconnect and clear
// ---------------------------------------------------------------------------

fn ping(_: &()) -> sigorder::SlotResult {
    Ok(())
}

#[test]
fn disconnect_by_value_is_scoped_to_the_key() {
    let mut signal = SortedSignal::<&'static str, ()>::new();
    let _a = signal.connect("a", ping as fn(&()) -> sigorder::SlotResult);
    let _b = signal.connect("b", ping as fn(&()) -> sigorder::SlotResult);

    assert!(signal.disconnect(&"a", &(ping as fn(&()) -> sigorder::SlotResult)));
    assert!(!signal.disconnect(&"a", &(ping as fn(&()) -> sigorder::SlotResult)));
    assert!(!signal.disconnect(&"missing", &(ping as fn(&()) -> sigorder::SlotResult)));
    assert_eq!(signal.group(&"b").map(|group| group.len()), Some(1));
}

#[test]
fn clear_expires_every_token() {
    let mut signal = SortedSignal::<&'static str, ()>::new();
    let log = CallLog::new();
    let a = record(&mut signal, "a", &log);
    signal.add_dependency("b", "a").unwrap();

    signal.clear();
    assert!(signal.is_empty());
    assert!(!a.is_connected());
    signal.emit(&()).unwrap();
    assert!(log.take().is_empty());
}

#[test]
fn emit_failures_are_keyed() {
    let mut signal = DeferredSortedSignal::<&'static str, ()>::new();
    let log = CallLog::new();
    let _fine = record(&mut signal, "fine", &log);
    let _bad = signal.connect("bad", |_| Err(anyhow::anyhow!("bad slot")));
    signal.add_dependency("bad", "fine").unwrap();

    match signal.emit(&()) {
        Err(EmitError::SlotsFailed(failures)) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].key, "bad");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(log.take(), vec!["fine"]);
}
