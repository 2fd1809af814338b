use std::collections::HashMap;

use log::debug;

use crate::bytecode::calldata::CallData;
use crate::bytecode::ir::Entry;
use crate::bytecode::op::{Insn, Label};
use crate::lang::literal::Literal;

/// Longest jump chain followed when threading jumps.
const MAX_THREADING: usize = 16;

/// Local rewrites applied to a finished instruction list.
///
/// Every rewrite preserves the stack effect of the code it replaces, so the
/// tracked `stack_max` stays valid.
pub fn optimize(entries: &mut Vec<Entry>) {
    let threaded = thread_jumps(entries);
    let fused = fuse_pairs(entries);
    if threaded + fused > 0 {
        debug!("peephole: {} jumps rewritten, {} pairs fused", threaded, fused);
    }
}

/// First instruction executed after `label`.
fn target_insn<'a>(entries: &'a [Entry], positions: &HashMap<Label, usize>, label: Label) -> Option<&'a Insn> {
    let start = *positions.get(&label)?;
    entries[start..].iter().find_map(Entry::as_insn)
}

fn thread_jumps(entries: &mut [Entry]) -> usize {
    let positions: HashMap<Label, usize> = entries
        .iter()
        .enumerate()
        .filter_map(|(i, entry)| match entry {
            Entry::Label(label) => Some((*label, i)),
            Entry::Insn(_) => None,
        })
        .collect();

    let mut rewritten = 0;
    for i in 0..entries.len() {
        let Entry::Insn(Insn::Jump(mut target)) = entries[i] else {
            continue;
        };
        let original = target;
        let mut replacement = None;
        for _ in 0..MAX_THREADING {
            match target_insn(entries, &positions, target) {
                Some(Insn::Leave) => {
                    replacement = Some(Insn::Leave);
                    break;
                }
                Some(Insn::Jump(next)) if *next != target => target = *next,
                _ => break,
            }
        }
        let insn = replacement.unwrap_or(Insn::Jump(target));
        if insn != Insn::Jump(original) {
            entries[i] = Entry::Insn(insn);
            rewritten += 1;
        }
    }
    rewritten
}

fn is_plain_call(calldata: &CallData, methods: &[&str]) -> bool {
    calldata.argc == 0 && calldata.is_simple() && methods.contains(&calldata.method.as_str())
}

fn blockless_call(insn: &Insn) -> Option<&std::rc::Rc<CallData>> {
    match insn {
        Insn::OptSendWithoutBlock(calldata) => Some(calldata),
        Insn::Send { calldata, block: None } => Some(calldata),
        _ => None,
    }
}

fn fuse(first: &Insn, second: &Insn) -> Option<Insn> {
    let calldata = blockless_call(second)?;
    match first {
        Insn::PutString(value) | Insn::PutObject(Literal::String(value))
            if is_plain_call(calldata, &["freeze", "-@"]) =>
        {
            let value = value.clone();
            let calldata = calldata.clone();
            Some(if calldata.method == "freeze" {
                Insn::OptStrFreeze { value, calldata }
            } else {
                Insn::OptStrUMinus { value, calldata }
            })
        }
        Insn::NewArray(n) if is_plain_call(calldata, &["max"]) => Some(Insn::OptNewArrayMax(*n)),
        Insn::NewArray(n) if is_plain_call(calldata, &["min"]) => Some(Insn::OptNewArrayMin(*n)),
        _ => None,
    }
}

fn fuse_pairs(entries: &mut Vec<Entry>) -> usize {
    let mut fused = 0;
    let mut i = 0;
    while i + 1 < entries.len() {
        if let (Entry::Insn(first), Entry::Insn(second)) = (&entries[i], &entries[i + 1]) {
            if let Some(insn) = fuse(first, second) {
                entries[i] = Entry::Insn(insn);
                entries.remove(i + 1);
                fused += 1;
            }
        }
        i += 1;
    }
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insn(insn: Insn) -> Entry {
        Entry::Insn(insn)
    }

    #[test]
    fn test_jump_to_leave_becomes_leave() {
        let mut entries = vec![
            insn(Insn::PutNil),
            insn(Insn::Jump(Label(0))),
            Entry::Label(Label(0)),
            insn(Insn::Leave),
        ];
        optimize(&mut entries);
        assert_eq!(entries[1], insn(Insn::Leave));
    }

    #[test]
    fn test_jump_chains_are_threaded() {
        let mut entries = vec![
            insn(Insn::Jump(Label(0))),
            Entry::Label(Label(0)),
            insn(Insn::Jump(Label(1))),
            Entry::Label(Label(1)),
            insn(Insn::PutNil),
            insn(Insn::Pop),
        ];
        optimize(&mut entries);
        assert_eq!(entries[0], insn(Insn::Jump(Label(1))));
    }

    #[test]
    fn test_self_loop_is_left_alone() {
        let mut entries = vec![Entry::Label(Label(0)), insn(Insn::Jump(Label(0)))];
        optimize(&mut entries);
        assert_eq!(entries[1], insn(Insn::Jump(Label(0))));
    }

    #[test]
    fn test_string_freeze_fusion() {
        let mut entries = vec![
            insn(Insn::PutString("a".to_string())),
            insn(Insn::OptSendWithoutBlock(CallData::simple("freeze", 0))),
            insn(Insn::Leave),
        ];
        optimize(&mut entries);
        assert_eq!(entries.len(), 2);
        assert!(matches!(&entries[0], Entry::Insn(Insn::OptStrFreeze { value, .. }) if value == "a"));
    }

    #[test]
    fn test_newarray_max_fusion() {
        let mut entries = vec![
            insn(Insn::PutNil),
            insn(Insn::PutNil),
            insn(Insn::NewArray(2)),
            insn(Insn::OptSendWithoutBlock(CallData::simple("max", 0))),
        ];
        optimize(&mut entries);
        assert_eq!(entries.last(), Some(&insn(Insn::OptNewArrayMax(2))));
    }

    #[test]
    fn test_label_blocks_fusion() {
        let mut entries = vec![
            insn(Insn::PutString("a".to_string())),
            Entry::Label(Label(0)),
            insn(Insn::OptSendWithoutBlock(CallData::simple("freeze", 0))),
        ];
        optimize(&mut entries);
        assert_eq!(entries.len(), 3);
    }
}
