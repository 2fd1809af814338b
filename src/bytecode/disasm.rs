use std::collections::HashMap;
use std::fmt::Write;

use crate::bytecode::ir::{Entry, InstructionSequence, IseqId, Program};
use crate::bytecode::local_table::LocalKind;
use crate::bytecode::op::{Insn, Label};

/// Column the operands start at.
const OPERAND_COLUMN: usize = 39;
/// Column the stack annotation starts at.
const EFFECT_COLUMN: usize = 70;

/// Listing of every sequence in `program`, parents before children.
pub fn disassemble(program: &Program) -> String {
    let mut out = String::new();
    let mut pending = vec![IseqId::ROOT];
    while let Some(id) = pending.pop() {
        out.push_str(&disassemble_iseq(program, id));
        out.push('\n');
        let mut children = program.children(id);
        children.reverse();
        pending.extend(children);
    }
    out
}

/// Listing of one sequence.
pub fn disassemble_iseq(program: &Program, id: IseqId) -> String {
    let iseq = &program[id];
    let offsets = iseq.label_offsets();
    let mut out = String::new();

    let loc = iseq.location;
    let _ = writeln!(
        out,
        "== disasm: #<ISeq:{}@{}:{} ({},{})-({},{})>",
        iseq.name, iseq.file, loc.start_line, loc.start_line, loc.start_column, loc.end_line, loc.end_column
    );

    if !iseq.catch_table.is_empty() {
        let _ = writeln!(out, "== catch table");
        for entry in &iseq.catch_table {
            let _ = writeln!(
                out,
                "| catch type: {:<6} st: {:04} ed: {:04} sp: {:04} cont: {:04}",
                entry.kind.symbol(),
                offset_of(&offsets, entry.start),
                offset_of(&offsets, entry.end),
                entry.sp,
                offset_of(&offsets, entry.cont),
            );
            if let Some(handler) = entry.iseq {
                for line in disassemble_iseq(program, handler).lines() {
                    let _ = writeln!(out, "| {}", line);
                }
            }
        }
        let _ = writeln!(out, "|{}", "-".repeat(72));
    }

    if !iseq.local_table.is_empty() {
        write_local_table(&mut out, iseq);
    }

    let mut offset = 0;
    for entry in &iseq.entries {
        let Entry::Insn(insn) = entry else {
            continue;
        };
        let mut line = format!("{:04} {}", offset, insn.name());
        let operands = operands(program, id, insn, &offsets);
        if !operands.is_empty() {
            pad_to(&mut line, OPERAND_COLUMN);
            line.push_str(&operands.join(", "));
        }
        pad_to(&mut line, EFFECT_COLUMN);
        let _ = write!(line, "( {} -- {} )", insn.pops(), insn.pushes());
        let _ = writeln!(out, "{}", line);
        offset += insn.length();
    }
    out
}

fn pad_to(line: &mut String, column: usize) {
    let width = line.chars().count();
    let spaces = if width < column { column - width } else { 1 };
    line.push_str(&" ".repeat(spaces));
}

fn offset_of(offsets: &HashMap<Label, usize>, label: Label) -> usize {
    offsets.get(&label).copied().unwrap_or_default()
}

fn write_local_table(out: &mut String, iseq: &InstructionSequence) {
    let args = &iseq.args;
    let signed = |value: Option<usize>| value.map_or(-1, |v| v as i64);
    let _ = writeln!(
        out,
        "local table (size: {}, argc: {} [opts: {}, rest: {}, post: {}, block: {}])",
        iseq.local_table.size(),
        args.lead_num,
        args.opt_num(),
        signed(args.rest_start),
        args.post_num,
        signed(args.block_start),
    );
    let entries: Vec<String> = (0..iseq.local_table.size())
        .filter_map(|index| {
            let local = iseq.local_table.get(index)?;
            let role = if index < args.lead_num {
                "<Arg>"
            } else if index < args.lead_num + args.opt_num() {
                "<Opt>"
            } else if Some(index) == args.rest_start {
                "<Rest>"
            } else if args.post_start.is_some_and(|p| index >= p && index < p + args.post_num) {
                "<Post>"
            } else if local.kind == LocalKind::BlockProxy {
                "<Block>"
            } else {
                ""
            };
            Some(format!(
                "[{:>2}] {}@{}{}",
                iseq.local_table.offset(index),
                local.name,
                index,
                role
            ))
        })
        .collect();
    let _ = writeln!(out, "{}", entries.join(" "));
}

fn local_operand(program: &Program, id: IseqId, index: usize, level: usize) -> String {
    let name = program.local_name(id, index, level).unwrap_or("?");
    format!("{}@{}", name, index)
}

fn child_name(program: &Program, id: IseqId) -> String {
    match program.get(id) {
        Some(iseq) => format!("<ISeq:{}>", iseq.name),
        None => format!("<ISeq:#{}>", id.0),
    }
}

/// Rendered operands of `insn`, in encoding order.
pub fn operands(program: &Program, id: IseqId, insn: &Insn, offsets: &HashMap<Label, usize>) -> Vec<String> {
    let iseq = &program[id];
    let label = |label: &Label| iseq.label_name(*label, offsets);
    match insn {
        Insn::AdjustStack(n)
        | Insn::ConcatStrings(n)
        | Insn::DupN(n)
        | Insn::NewArray(n)
        | Insn::NewHash(n)
        | Insn::OptNewArrayMax(n)
        | Insn::OptNewArrayMin(n)
        | Insn::SetN(n)
        | Insn::TopN(n) => vec![n.to_string()],
        Insn::NewRange(flag) | Insn::PutSpecialObject(flag) | Insn::Throw(flag) | Insn::CheckMatch(flag) => {
            vec![flag.to_string()]
        }
        Insn::SplatArray(copy) => vec![copy.to_string()],

        Insn::BranchIf(target) | Insn::BranchNil(target) | Insn::BranchUnless(target) | Insn::Jump(target) => {
            vec![label(target)]
        }
        Insn::OptGetInlineCache { label: target, cache } => vec![label(target), format!("<is:{}>", cache)],
        Insn::OptSetInlineCache(cache) => vec![format!("<is:{}>", cache)],

        Insn::DefineClass { name, iseq: child, flags } => {
            vec![format!(":{}", name), child_name(program, *child), flags.to_string()]
        }
        Insn::DefineMethod { name, iseq: child } | Insn::DefineSMethod { name, iseq: child } => {
            vec![format!(":{}", name), child_name(program, *child)]
        }

        Insn::DupArray(value) | Insn::DupHash(value) | Insn::PutObject(value) => vec![value.to_string()],
        Insn::PutString(value) => vec![crate::lang::literal::quote_string(value)],
        Insn::OptStrFreeze { value, calldata } | Insn::OptStrUMinus { value, calldata } => {
            vec![crate::lang::literal::quote_string(value), calldata.to_string()]
        }

        Insn::GetLocal { index, level } | Insn::SetLocal { index, level } | Insn::GetBlockParam { index, level } => {
            vec![local_operand(program, id, *index, *level), level.to_string()]
        }
        Insn::GetLocalWC0(index) | Insn::SetLocalWC0(index) => vec![local_operand(program, id, *index, 0)],
        Insn::GetLocalWC1(index) | Insn::SetLocalWC1(index) => vec![local_operand(program, id, *index, 1)],

        Insn::GetInstanceVariable { name, cache } | Insn::SetInstanceVariable { name, cache } => {
            vec![format!(":{}", name), format!("<is:{}>", cache)]
        }
        Insn::GetClassVariable { name, cache } | Insn::SetClassVariable { name, cache } => {
            let mut out = vec![format!(":{}", name)];
            out.extend(cache.map(|slot| format!("<is:{}>", slot)));
            out
        }
        Insn::GetGlobal(name) | Insn::SetGlobal(name) | Insn::GetConstant(name) | Insn::SetConstant(name) => {
            vec![format!(":{}", name)]
        }
        Insn::OptGetConstantPath { names, .. } => {
            let path: Vec<String> = names.iter().map(|n| format!(":{}", n)).collect();
            vec![format!("<ic:[{}]>", path.join(", "))]
        }

        Insn::Send { calldata, block } | Insn::InvokeSuper { calldata, block } => {
            let block = block.map_or_else(|| "nil".to_string(), |child| child_name(program, child));
            vec![calldata.to_string(), block]
        }
        Insn::OptNeq { eq, neq } => vec![eq.to_string(), neq.to_string()],
        Insn::InvokeBlock(cd) | Insn::ObjToString(cd) | Insn::Opt(_, cd) | Insn::OptSendWithoutBlock(cd) => {
            vec![cd.to_string()]
        }

        Insn::AnyToString
        | Insn::Dup
        | Insn::Intern
        | Insn::Leave
        | Insn::Nop
        | Insn::Pop
        | Insn::PutNil
        | Insn::PutObjectInt2Fix0
        | Insn::PutObjectInt2Fix1
        | Insn::PutSelf
        | Insn::Swap => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile;
    use crate::lang::node::{Node, Params};

    fn listing(node: Node) -> String {
        let program = compile(&Node::program(vec![node])).unwrap();
        disassemble(&program)
    }

    #[test]
    fn test_header_and_offsets() {
        let text = listing(Node::binary(Node::int(2), "+", Node::int(3)));
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("== disasm: #<ISeq:<main>@<compiled>:"));
        assert!(lines[1].starts_with("0000 putobject"));
        assert!(lines[2].starts_with("0002 putobject"));
        assert!(lines[3].starts_with("0004 opt_plus"));
        assert!(lines[3].contains("<calldata!mid:+, argc:1, ARGS_SIMPLE>"));
        assert!(lines[3].ends_with("( 2 -- 1 )"));
        assert!(lines[4].starts_with("0006 leave"));
    }

    #[test]
    fn test_method_locals_and_children() {
        let text = listing(Node::def("f", Params::required(&["x"]), Node::lvar("x")));
        assert!(text.contains("definemethod"));
        assert!(text.contains(":f, <ISeq:f>"));
        assert!(text.contains("== disasm: #<ISeq:f@<compiled>"));
        assert!(text.contains("[ 3] x@0<Arg>"));
        assert!(text.contains("getlocal_WC_0"));
        assert!(text.contains("x@0"));
    }

    #[test]
    fn test_branch_labels_use_word_offsets() {
        let node = Node::if_else(Node::lvar("a"), Node::int(1), Some(Node::int(2)));
        let program = compile(&Node::program(vec![Node::lasgn("a", Node::nil()), node])).unwrap();
        let text = disassemble_iseq(&program, IseqId::ROOT);
        // putnil(1) setlocal(2) getlocal(2) branchunless(2) putobject(1) leave(1)
        let branch = text.lines().find(|line| line.contains("branchunless")).unwrap();
        assert!(branch.starts_with("0005 "));
        assert!(branch.contains("label_9"));
    }
}
