//! Built-in sample programs for `cinder demo` and `cinder dump`.
//!
//! Trees are built by hand the way an external parser would hand them
//! over; source lines are attached so disassembly shows real locations.

use cinder::lang::node::{Node, NodeKind, Params, RescueClause};
use cinder::lang::location::Location;

pub struct Sample {
    pub name: &'static str,
    pub source: &'static str,
    pub build: fn() -> Node,
    /// `inspect` of the value the program evaluates to.
    pub expected: &'static str,
}

pub const SAMPLES: &[Sample] = &[
    Sample {
        name: "arith",
        source: "2 + 3 * 4",
        build: arith,
        expected: "14",
    },
    Sample {
        name: "method",
        source: "def add_one(x) = x + 1\nadd_one(5)",
        build: method,
        expected: "6",
    },
    Sample {
        name: "block",
        source: "total = 0\n[1, 2, 3].each { |i| total += i }\ntotal",
        build: block,
        expected: "6",
    },
    Sample {
        name: "class",
        source: "class Counter\n  def initialize = @n = 0\n  def incr = @n += 1\nend\nc = Counter.new\nc.incr\nc.incr",
        build: class,
        expected: "2",
    },
    Sample {
        name: "rescue",
        source: "begin\n  raise ArgumentError, \"bad\"\nrescue ArgumentError => e\n  e.message\nend",
        build: rescue,
        expected: "\"bad\"",
    },
    Sample {
        name: "loop",
        source: "i = 0\nwhile i < 10\n  i += 1\nend\ni",
        build: while_loop,
        expected: "10",
    },
];

pub fn find(name: &str) -> Option<&'static Sample> {
    SAMPLES.iter().find(|sample| sample.name == name)
}

fn line(node: Node, line: usize) -> Node {
    node.at(Location::line(line))
}

fn op_assign(target: Node, operator: &str, value: Node) -> Node {
    Node::new(NodeKind::OpAssign {
        target: Box::new(target),
        operator: operator.to_string(),
        value: Box::new(value),
    })
}

fn arith() -> Node {
    Node::program(vec![line(
        Node::binary(Node::int(2), "+", Node::binary(Node::int(3), "*", Node::int(4))),
        1,
    )])
}

fn method() -> Node {
    let body = Node::binary(Node::lvar("x"), "+", Node::int(1));
    Node::program(vec![
        line(Node::def("add_one", Params::required(&["x"]), body), 1),
        line(Node::fcall("add_one", vec![Node::int(5)]), 2),
    ])
}

fn block() -> Node {
    let items = Node::new(NodeKind::Array(vec![Node::int(1), Node::int(2), Node::int(3)]));
    let each = Node::call(Some(items), "each", vec![])
        .with_block(Params::required(&["i"]), op_assign(Node::lvar("total"), "+", Node::lvar("i")));
    Node::program(vec![
        line(Node::lasgn("total", Node::int(0)), 1),
        line(each, 2),
        line(Node::lvar("total"), 3),
    ])
}

fn class() -> Node {
    let initialize = Node::def(
        "initialize",
        Params::default(),
        Node::new(NodeKind::InstanceAssign {
            name: "@n".to_string(),
            value: Box::new(Node::int(0)),
        }),
    );
    let incr = Node::def("incr", Params::default(), op_assign(Node::ivar("@n"), "+", Node::int(1)));
    let counter = Node::new(NodeKind::Class {
        name: "Counter".to_string(),
        superclass: None,
        body: Box::new(Node::statements(vec![line(initialize, 2), line(incr, 3)])),
    });
    let c = || Node::lvar("c");
    Node::program(vec![
        line(counter, 1),
        line(Node::lasgn("c", Node::call(Some(Node::constant("Counter")), "new", vec![])), 5),
        line(Node::call(Some(c()), "incr", vec![]), 6),
        line(Node::call(Some(c()), "incr", vec![]), 7),
    ])
}

fn rescue() -> Node {
    let raise = Node::fcall("raise", vec![Node::constant("ArgumentError"), Node::str("bad")]);
    let node = Node::new(NodeKind::Begin {
        body: Box::new(line(raise, 2)),
        rescues: vec![RescueClause {
            exceptions: vec![Node::constant("ArgumentError")],
            binding: Some("e".to_string()),
            body: line(Node::call(Some(Node::lvar("e")), "message", vec![]), 4),
        }],
        else_branch: None,
        ensure: None,
    });
    Node::program(vec![line(node, 1)])
}

fn while_loop() -> Node {
    let node = Node::new(NodeKind::While {
        predicate: Box::new(Node::binary(Node::lvar("i"), "<", Node::int(10))),
        body: Box::new(line(op_assign(Node::lvar("i"), "+", Node::int(1)), 3)),
    });
    Node::program(vec![
        line(Node::lasgn("i", Node::int(0)), 1),
        line(node, 2),
        line(Node::lvar("i"), 5),
    ])
}
