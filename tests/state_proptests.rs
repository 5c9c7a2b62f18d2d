//! Property-based tests for the packed state word.
//!
//! The slot array is the node's only source of ordering, so its pure
//! mutators are checked against a plain vector model: after any sequence
//! of adds and removes, every logical position must agree with the model
//! and no physical slot may be referenced twice.

use proptest::prelude::*;
use tlbtree::state::{StateWord, CARDINALITY};

// ============================================================================
//  Model
// ============================================================================

#[derive(Clone, Copy, Debug)]
enum Op {
    /// Insert at (position % (len + 1)) using the smallest free slot.
    Add(usize),

    /// Remove at (position % len); skipped when empty.
    Remove(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..CARDINALITY).prop_map(Op::Add),
        (0usize..CARDINALITY).prop_map(Op::Remove),
    ]
}

fn check_against_model(word: StateWord, model: &[usize]) -> Result<(), TestCaseError> {
    prop_assert_eq!(word.count(), model.len());

    let mut seen = [false; CARDINALITY];
    for (i, &slot) in model.iter().enumerate() {
        prop_assert_eq!(word.read(i), slot, "logical position {} diverged", i);
        prop_assert!(!seen[slot], "slot {} referenced twice", slot);
        seen[slot] = true;
    }
    Ok(())
}

// ============================================================================
//  Properties
// ============================================================================

proptest! {
    /// Random add/remove sequences keep the word in lockstep with a
    /// vector model.
    #[test]
    fn slot_array_matches_vector_model(ops in prop::collection::vec(op_strategy(), 0..200)) {
        let mut word = StateWord::empty();
        let mut model: Vec<usize> = Vec::new();

        for op in ops {
            match op {
                Op::Add(pos) => {
                    if model.len() == CARDINALITY {
                        continue;
                    }
                    let pos = pos % (model.len() + 1);
                    let slot = word.alloc();
                    word = word.add(pos, slot);
                    model.insert(pos, slot);
                }
                Op::Remove(pos) => {
                    if model.is_empty() {
                        continue;
                    }
                    let pos = pos % model.len();
                    word = word.remove(pos);
                    model.remove(pos);
                }
            }

            check_against_model(word, &model)?;
        }
    }

    /// `alloc` always returns a slot unused by the occupied prefix.
    #[test]
    fn alloc_never_collides(adds in prop::collection::vec(0usize..CARDINALITY, 1..=CARDINALITY)) {
        let mut word = StateWord::empty();
        let mut used: Vec<usize> = Vec::new();

        for pos in adds {
            if used.len() == CARDINALITY {
                break;
            }
            let slot = word.alloc();
            prop_assert!(!used.contains(&slot), "alloc returned occupied slot {}", slot);
            word = word.add(pos % (used.len() + 1), slot);
            used.push(slot);
        }
    }

    /// Append mirrors add without touching the count, which is applied
    /// separately when the node is published.
    #[test]
    fn append_then_count_equals_adds(n in 1usize..=CARDINALITY) {
        let mut appended = StateWord::empty();
        let mut added = StateWord::empty();

        for i in 0..n {
            appended = appended.append(i, i);
            added = added.add(i, i);
        }
        appended = appended.with_count(n);

        prop_assert_eq!(appended.count(), added.count());
        for i in 0..n {
            prop_assert_eq!(appended.read(i), added.read(i));
        }
    }

    /// Version bumps never leak into neighboring fields.
    #[test]
    fn version_bump_preserves_payload(bumps in 0usize..200, adds in 0usize..=CARDINALITY) {
        let mut word = StateWord::empty();
        for i in 0..adds {
            word = word.add(i, i);
        }
        let count_before = word.count();
        let slots_before: Vec<usize> = (0..count_before).map(|i| word.read(i)).collect();
        let sibling_before = word.sibling_version();

        for _ in 0..bumps {
            word = word.with_version_bumped();
        }

        prop_assert_eq!(word.count(), count_before);
        prop_assert_eq!(word.sibling_version(), sibling_before);
        for (i, &slot) in slots_before.iter().enumerate() {
            prop_assert_eq!(word.read(i), slot);
        }
    }
}
