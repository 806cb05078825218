use std::collections::BTreeMap;
use std::thread;

use sgeval_comm::{thread_group, CommError, Collective};

#[test]
fn all_gather_is_rank_ordered() {
    let handles = thread_group(4).unwrap();
    let workers: Vec<_> = handles
        .into_iter()
        .map(|c| {
            thread::spawn(move || {
                let rank = c.rank();
                c.all_gather(rank * 10).unwrap()
            })
        })
        .collect();

    for w in workers {
        assert_eq!(w.join().unwrap(), vec![0, 10, 20, 30]);
    }
}

#[test]
fn repeated_gathers_do_not_mix_rounds() {
    let handles = thread_group(3).unwrap();
    let workers: Vec<_> = handles
        .into_iter()
        .map(|c| {
            thread::spawn(move || {
                let mut rounds = Vec::new();
                for round in 0..20u64 {
                    let mut part = BTreeMap::new();
                    part.insert(round * 3 + c.rank() as u64, format!("r{round}"));
                    rounds.push(c.all_gather(part).unwrap());
                    c.barrier().unwrap();
                }
                rounds
            })
        })
        .collect();

    for w in workers {
        let rounds = w.join().unwrap();
        for (round, gathered) in rounds.iter().enumerate() {
            let round = round as u64;
            let keys: Vec<u64> = gathered.iter().flat_map(|m| m.keys().copied()).collect();
            assert_eq!(keys, vec![round * 3, round * 3 + 1, round * 3 + 2]);
        }
    }
}

#[test]
fn mismatched_types_fail_on_every_rank() {
    let mut handles = thread_group(2).unwrap();
    let c1 = handles.pop().unwrap();
    let c0 = handles.pop().unwrap();

    let t0 = thread::spawn(move || c0.all_gather(1u32));
    let t1 = thread::spawn(move || c1.all_gather("one".to_string()));

    assert!(matches!(
        t0.join().unwrap(),
        Err(CommError::TypeMismatch { rank: 1 })
    ));
    assert!(matches!(
        t1.join().unwrap(),
        Err(CommError::TypeMismatch { rank: 0 })
    ));
}

#[test]
fn empty_group_is_rejected() {
    assert!(matches!(thread_group(0), Err(CommError::EmptyWorld)));
}

#[test]
fn only_rank_zero_is_main() {
    let handles = thread_group(3).unwrap();
    let mains: Vec<bool> = handles.iter().map(|c| c.is_main_process()).collect();
    assert_eq!(mains, vec![true, false, false]);
}
