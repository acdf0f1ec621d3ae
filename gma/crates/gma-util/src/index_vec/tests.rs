//! Tests for the IndexVec module.

use super::*;
use quickcheck_macros::quickcheck;

crate::define_idx!(TestId);

// ============================================================================
// BASIC OPERATIONS
// ============================================================================

#[test]
fn test_new_and_empty() {
    let vec: IndexVec<TestId, u64> = IndexVec::new();
    assert!(vec.is_empty());
    assert_eq!(vec.len(), 0);
}

#[test]
fn test_push_returns_sequential_indices() {
    let mut vec: IndexVec<TestId, u64> = IndexVec::new();
    let a = vec.push(10);
    let b = vec.push(20);

    assert_eq!(a, TestId(0));
    assert_eq!(b, TestId(1));
    assert_eq!(vec[a], 10);
    assert_eq!(vec[b], 20);
    assert_eq!(vec.len(), 2);
}

#[test]
fn test_get_out_of_bounds() {
    let mut vec: IndexVec<TestId, u64> = IndexVec::new();
    vec.push(1);
    assert_eq!(vec.get(TestId(0)), Some(&1));
    assert_eq!(vec.get(TestId(1)), None);
}

#[test]
fn test_index_mut_and_clear() {
    let mut vec: IndexVec<TestId, Option<u64>> = IndexVec::new();
    let a = vec.push(Some(1));
    vec[a] = None;
    assert_eq!(vec.get(a), Some(&None));
    *vec.get_mut(a).unwrap() = Some(9);
    assert_eq!(vec[a], Some(9));

    vec.clear();
    assert!(vec.is_empty());
    assert_eq!(vec.get(a), None);
}

// ============================================================================
// ITERATION
// ============================================================================

#[test]
fn test_iter_enumerated_pairs() {
    let mut vec: IndexVec<TestId, u64> = IndexVec::new();
    vec.push(7);
    vec.push(8);

    let pairs: Vec<_> = vec.iter_enumerated().map(|(i, v)| (i.0, *v)).collect();
    assert_eq!(pairs, vec![(0, 7), (1, 8)]);
}

#[test]
#[should_panic(expected = "exceeds u32::MAX")]
fn test_define_idx_rejects_overflow() {
    let _ = TestId::from_usize(u32::MAX as usize + 1);
}

#[quickcheck]
fn prop_push_then_index_roundtrips(values: Vec<u64>) -> bool {
    let mut vec: IndexVec<TestId, u64> = IndexVec::new();
    let ids: Vec<TestId> = values.iter().map(|v| vec.push(*v)).collect();
    ids.iter().zip(values.iter()).all(|(id, v)| vec[*id] == *v)
}
