use super::literal::Literal;
use super::location::Location;

/// Syntax tree node handed to the compiler by the external parser.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub location: Location,
}

/// The kind of a [`Node`] together with its typed children.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    // ───────────────────────────── Structure ────────────────────────────
    /// Whole compilation unit.
    Program(Vec<Node>),

    /// Sequence of statements; evaluates to the last one (or `nil`).
    Statements(Vec<Node>),

    // ───────────────────────────── Literals ─────────────────────────────
    Nil,
    True,
    False,

    /// `self`
    SelfRef,

    Integer(i64),
    Float(f64),

    /// Plain string literal without interpolation.
    Str(String),

    /// `"a#{b}c"`; parts are `Str` nodes or arbitrary expressions.
    InterpolatedStr(Vec<Node>),

    Symbol(String),

    /// `[a, b, c]`
    Array(Vec<Node>),

    /// `{ k => v }`
    Hash(Vec<(Node, Node)>),

    /// `a..b`, `a...b`, endless and beginless forms.
    Range {
        left: Option<Box<Node>>,
        right: Option<Box<Node>>,
        exclusive: bool,
    },

    // ───────────────────────────── Variables ────────────────────────────
    LocalVar(String),
    LocalAssign {
        name: String,
        value: Box<Node>,
    },

    /// `@name`
    InstanceVar(String),
    InstanceAssign {
        name: String,
        value: Box<Node>,
    },

    /// `$name`
    GlobalVar(String),
    GlobalAssign {
        name: String,
        value: Box<Node>,
    },

    /// `@@name`
    ClassVar(String),
    ClassVarAssign {
        name: String,
        value: Box<Node>,
    },

    /// Bare constant reference: `Foo`.
    Const(String),

    /// `Scope::Name`; a missing scope means top-level `::Name`.
    ConstPath {
        scope: Option<Box<Node>>,
        name: String,
    },

    /// `Foo = value`
    ConstAssign {
        name: String,
        value: Box<Node>,
    },

    /// `target op= value`, including `||=` and `&&=`.
    OpAssign {
        target: Box<Node>,
        operator: String,
        value: Box<Node>,
    },

    // ─────────────────────────────── Calls ──────────────────────────────
    /// Method call. Arguments may contain `Splat`, `KeywordArgs` and
    /// `BlockPass` nodes; `block` is a `Block` node.
    Call {
        receiver: Option<Box<Node>>,
        name: String,
        args: Vec<Node>,
        block: Option<Box<Node>>,
    },

    /// `left op right`; compiled as a call of `op` on `left`.
    Binary {
        left: Box<Node>,
        operator: String,
        right: Box<Node>,
    },

    /// `-x`, `~x`, `+x`; the operator is the method name (`-@`, `~`, `+@`).
    Unary {
        operator: String,
        operand: Box<Node>,
    },

    /// `!x` / `not x`
    Not(Box<Node>),

    /// `*args` inside an argument list.
    Splat(Box<Node>),

    /// `&blk` inside an argument list.
    BlockPass(Box<Node>),

    /// `key: value` pairs at the end of an argument list.
    KeywordArgs(Vec<(String, Node)>),

    /// `yield a, b`
    Yield(Vec<Node>),

    /// `super(a)`; `None` arguments mean implicit `super`.
    Super(Option<Vec<Node>>),

    // ─────────────────────────── Control flow ───────────────────────────
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),

    If {
        predicate: Box<Node>,
        then_branch: Box<Node>,
        else_branch: Option<Box<Node>>,
    },
    Unless {
        predicate: Box<Node>,
        then_branch: Box<Node>,
        else_branch: Option<Box<Node>>,
    },

    While {
        predicate: Box<Node>,
        body: Box<Node>,
    },
    Until {
        predicate: Box<Node>,
        body: Box<Node>,
    },

    Break(Option<Box<Node>>),
    Next(Option<Box<Node>>),
    Return(Option<Box<Node>>),
    Redo,
    Retry,

    /// `case subject; when a, b then ...; else ...; end`
    Case {
        subject: Option<Box<Node>>,
        whens: Vec<WhenClause>,
        else_branch: Option<Box<Node>>,
    },

    /// `case subject; in pattern if guard then ...; end`
    CaseIn {
        subject: Box<Node>,
        clauses: Vec<InClause>,
        else_branch: Option<Box<Node>>,
    },

    /// `begin; body; rescue ...; else ...; ensure ...; end`
    Begin {
        body: Box<Node>,
        rescues: Vec<RescueClause>,
        else_branch: Option<Box<Node>>,
        ensure: Option<Box<Node>>,
    },

    // ─────────────────────────── Definitions ────────────────────────────
    /// `def name(params) body end`, or `def recv.name` when `receiver` is set.
    Def {
        receiver: Option<Box<Node>>,
        name: String,
        params: Params,
        body: Box<Node>,
    },

    /// `{ |params| body }` attached to a call.
    Block {
        params: Params,
        body: Box<Node>,
    },

    /// `->(params) { body }`
    Lambda {
        params: Params,
        body: Box<Node>,
    },

    Class {
        name: String,
        superclass: Option<Box<Node>>,
        body: Box<Node>,
    },

    Module {
        name: String,
        body: Box<Node>,
    },

    /// `alias new old`
    Alias {
        new_name: String,
        old_name: String,
    },
}

/// Formal parameters of a method, block or lambda.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Params {
    pub required: Vec<String>,
    pub optional: Vec<(String, Node)>,
    pub rest: Option<String>,
    pub post: Vec<String>,
    pub block: Option<String>,
}

impl Params {
    pub fn required(names: &[&str]) -> Self {
        Self {
            required: names.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
            && self.optional.is_empty()
            && self.rest.is_none()
            && self.post.is_empty()
            && self.block.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhenClause {
    pub conditions: Vec<Node>,
    pub body: Node,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InClause {
    pub pattern: Pattern,
    pub guard: Option<Node>,
    pub body: Node,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RescueClause {
    /// Exception classes to match; empty means `StandardError`.
    pub exceptions: Vec<Node>,
    /// `=> name`
    pub binding: Option<String>,
    pub body: Node,
}

/// Pattern of a `case`/`in` clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    /// Matches when `value === subject`.
    Value(Node),
    /// Binds the subject to a local; always matches.
    Bind(String),
    /// `a | b | c`
    Alternatives(Vec<Pattern>),
    /// `[a, b]`: an array of exactly this length whose elements match.
    Array(Vec<Pattern>),
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            location: Location::default(),
        }
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn program(statements: Vec<Node>) -> Self {
        Node::new(NodeKind::Program(statements))
    }

    pub fn statements(statements: Vec<Node>) -> Self {
        Node::new(NodeKind::Statements(statements))
    }

    pub fn int(value: i64) -> Self {
        Node::new(NodeKind::Integer(value))
    }

    pub fn float(value: f64) -> Self {
        Node::new(NodeKind::Float(value))
    }

    pub fn str(value: &str) -> Self {
        Node::new(NodeKind::Str(value.to_string()))
    }

    pub fn sym(value: &str) -> Self {
        Node::new(NodeKind::Symbol(value.to_string()))
    }

    pub fn nil() -> Self {
        Node::new(NodeKind::Nil)
    }

    pub fn lvar(name: &str) -> Self {
        Node::new(NodeKind::LocalVar(name.to_string()))
    }

    pub fn lasgn(name: &str, value: Node) -> Self {
        Node::new(NodeKind::LocalAssign {
            name: name.to_string(),
            value: Box::new(value),
        })
    }

    pub fn ivar(name: &str) -> Self {
        Node::new(NodeKind::InstanceVar(name.to_string()))
    }

    pub fn constant(name: &str) -> Self {
        Node::new(NodeKind::Const(name.to_string()))
    }

    pub fn binary(left: Node, operator: &str, right: Node) -> Self {
        Node::new(NodeKind::Binary {
            left: Box::new(left),
            operator: operator.to_string(),
            right: Box::new(right),
        })
    }

    pub fn call(receiver: Option<Node>, name: &str, args: Vec<Node>) -> Self {
        Node::new(NodeKind::Call {
            receiver: receiver.map(Box::new),
            name: name.to_string(),
            args,
            block: None,
        })
    }

    /// Receiver-less call: `name(args)`.
    pub fn fcall(name: &str, args: Vec<Node>) -> Self {
        Node::call(None, name, args)
    }

    pub fn with_block(mut self, params: Params, body: Node) -> Self {
        if let NodeKind::Call { block, .. } = &mut self.kind {
            *block = Some(Box::new(Node::new(NodeKind::Block {
                params,
                body: Box::new(body),
            })));
        }
        self
    }

    pub fn def(name: &str, params: Params, body: Node) -> Self {
        Node::new(NodeKind::Def {
            receiver: None,
            name: name.to_string(),
            params,
            body: Box::new(body),
        })
    }

    pub fn if_else(predicate: Node, then_branch: Node, else_branch: Option<Node>) -> Self {
        Node::new(NodeKind::If {
            predicate: Box::new(predicate),
            then_branch: Box::new(then_branch),
            else_branch: else_branch.map(Box::new),
        })
    }

    pub fn ret(value: Option<Node>) -> Self {
        Node::new(NodeKind::Return(value.map(Box::new)))
    }

    /// Literal value of leaf nodes.
    pub fn literal(&self) -> Option<Literal> {
        match &self.kind {
            NodeKind::Nil => Some(Literal::Nil),
            NodeKind::True => Some(Literal::True),
            NodeKind::False => Some(Literal::False),
            NodeKind::Integer(n) => Some(Literal::Integer(*n)),
            NodeKind::Float(n) => Some(Literal::Float(*n)),
            NodeKind::Str(s) => Some(Literal::String(s.clone())),
            NodeKind::Symbol(s) => Some(Literal::Symbol(s.clone())),
            _ => None,
        }
    }

    /// Literal value of a whole subtree, when every part is a literal.
    pub fn static_literal(&self) -> Option<Literal> {
        match &self.kind {
            NodeKind::Array(items) => items
                .iter()
                .map(Node::static_literal)
                .collect::<Option<Vec<_>>>()
                .map(Literal::Array),
            NodeKind::Hash(pairs) => pairs
                .iter()
                .map(|(k, v)| Some((k.static_literal()?, v.static_literal()?)))
                .collect::<Option<Vec<_>>>()
                .map(Literal::Hash),
            NodeKind::Range {
                left,
                right,
                exclusive,
            } => {
                let bound = |n: &Option<Box<Node>>| -> Option<Option<Box<Literal>>> {
                    match n {
                        None => Some(None),
                        Some(n) => match n.kind {
                            NodeKind::Integer(_) => n.literal().map(|l| Some(Box::new(l))),
                            _ => None,
                        },
                    }
                };
                let start = bound(left)?;
                let end = bound(right)?;
                if start.is_none() && end.is_none() {
                    return None;
                }
                Some(Literal::Range {
                    start,
                    end,
                    exclusive: *exclusive,
                })
            }
            _ => self.literal(),
        }
    }

    /// Typed child nodes in source order.
    pub fn children(&self) -> Vec<&Node> {
        fn opt(node: &Option<Box<Node>>) -> Option<&Node> {
            node.as_deref()
        }
        fn pattern_children<'a>(pattern: &'a Pattern, out: &mut Vec<&'a Node>) {
            match pattern {
                Pattern::Value(node) => out.push(node),
                Pattern::Bind(_) => {}
                Pattern::Alternatives(items) | Pattern::Array(items) => {
                    for item in items {
                        pattern_children(item, out);
                    }
                }
            }
        }

        let mut out = Vec::new();
        match &self.kind {
            NodeKind::Program(items)
            | NodeKind::Statements(items)
            | NodeKind::InterpolatedStr(items)
            | NodeKind::Array(items)
            | NodeKind::Yield(items) => out.extend(items.iter()),
            NodeKind::Hash(pairs) => {
                for (k, v) in pairs {
                    out.push(k);
                    out.push(v);
                }
            }
            NodeKind::Range { left, right, .. } => {
                out.extend(opt(left));
                out.extend(opt(right));
            }
            NodeKind::LocalAssign { value, .. }
            | NodeKind::InstanceAssign { value, .. }
            | NodeKind::GlobalAssign { value, .. }
            | NodeKind::ClassVarAssign { value, .. }
            | NodeKind::ConstAssign { value, .. } => out.push(value),
            NodeKind::ConstPath { scope, .. } => out.extend(opt(scope)),
            NodeKind::OpAssign { target, value, .. } => {
                out.push(target);
                out.push(value);
            }
            NodeKind::Call {
                receiver,
                args,
                block,
                ..
            } => {
                out.extend(opt(receiver));
                out.extend(args.iter());
                out.extend(opt(block));
            }
            NodeKind::Binary { left, right, .. } | NodeKind::And(left, right) | NodeKind::Or(left, right) => {
                out.push(left);
                out.push(right);
            }
            NodeKind::Unary { operand, .. } => out.push(operand),
            NodeKind::Not(inner) | NodeKind::Splat(inner) | NodeKind::BlockPass(inner) => out.push(inner),
            NodeKind::KeywordArgs(pairs) => out.extend(pairs.iter().map(|(_, v)| v)),
            NodeKind::Super(args) => {
                if let Some(args) = args {
                    out.extend(args.iter());
                }
            }
            NodeKind::If {
                predicate,
                then_branch,
                else_branch,
            }
            | NodeKind::Unless {
                predicate,
                then_branch,
                else_branch,
            } => {
                out.push(predicate);
                out.push(then_branch);
                out.extend(opt(else_branch));
            }
            NodeKind::While { predicate, body } | NodeKind::Until { predicate, body } => {
                out.push(predicate);
                out.push(body);
            }
            NodeKind::Break(value) | NodeKind::Next(value) | NodeKind::Return(value) => {
                out.extend(opt(value));
            }
            NodeKind::Case {
                subject,
                whens,
                else_branch,
            } => {
                out.extend(opt(subject));
                for clause in whens {
                    out.extend(clause.conditions.iter());
                    out.push(&clause.body);
                }
                out.extend(opt(else_branch));
            }
            NodeKind::CaseIn {
                subject,
                clauses,
                else_branch,
            } => {
                out.push(subject);
                for clause in clauses {
                    pattern_children(&clause.pattern, &mut out);
                    out.extend(clause.guard.iter());
                    out.push(&clause.body);
                }
                out.extend(opt(else_branch));
            }
            NodeKind::Begin {
                body,
                rescues,
                else_branch,
                ensure,
            } => {
                out.push(body);
                for clause in rescues {
                    out.extend(clause.exceptions.iter());
                    out.push(&clause.body);
                }
                out.extend(opt(else_branch));
                out.extend(opt(ensure));
            }
            NodeKind::Def {
                receiver,
                params,
                body,
                ..
            } => {
                out.extend(opt(receiver));
                out.extend(params.optional.iter().map(|(_, v)| v));
                out.push(body);
            }
            NodeKind::Block { params, body } | NodeKind::Lambda { params, body } => {
                out.extend(params.optional.iter().map(|(_, v)| v));
                out.push(body);
            }
            NodeKind::Class {
                superclass, body, ..
            } => {
                out.extend(opt(superclass));
                out.push(body);
            }
            NodeKind::Module { body, .. } => out.push(body),
            NodeKind::Nil
            | NodeKind::True
            | NodeKind::False
            | NodeKind::SelfRef
            | NodeKind::Integer(_)
            | NodeKind::Float(_)
            | NodeKind::Str(_)
            | NodeKind::Symbol(_)
            | NodeKind::LocalVar(_)
            | NodeKind::InstanceVar(_)
            | NodeKind::GlobalVar(_)
            | NodeKind::ClassVar(_)
            | NodeKind::Const(_)
            | NodeKind::Redo
            | NodeKind::Retry
            | NodeKind::Alias { .. } => {}
        }
        out
    }

    /// Human-readable name of the node kind, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            NodeKind::Program(_) => "program",
            NodeKind::Statements(_) => "statements",
            NodeKind::Nil => "nil",
            NodeKind::True => "true",
            NodeKind::False => "false",
            NodeKind::SelfRef => "self",
            NodeKind::Integer(_) => "integer literal",
            NodeKind::Float(_) => "float literal",
            NodeKind::Str(_) => "string literal",
            NodeKind::InterpolatedStr(_) => "interpolated string",
            NodeKind::Symbol(_) => "symbol literal",
            NodeKind::Array(_) => "array literal",
            NodeKind::Hash(_) => "hash literal",
            NodeKind::Range { .. } => "range",
            NodeKind::LocalVar(_) => "local variable",
            NodeKind::LocalAssign { .. } => "local assignment",
            NodeKind::InstanceVar(_) => "instance variable",
            NodeKind::InstanceAssign { .. } => "instance variable assignment",
            NodeKind::GlobalVar(_) => "global variable",
            NodeKind::GlobalAssign { .. } => "global variable assignment",
            NodeKind::ClassVar(_) => "class variable",
            NodeKind::ClassVarAssign { .. } => "class variable assignment",
            NodeKind::Const(_) => "constant",
            NodeKind::ConstPath { .. } => "constant path",
            NodeKind::ConstAssign { .. } => "constant assignment",
            NodeKind::OpAssign { .. } => "operator assignment",
            NodeKind::Call { .. } => "call",
            NodeKind::Binary { .. } => "binary operator",
            NodeKind::Unary { .. } => "unary operator",
            NodeKind::Not(_) => "not",
            NodeKind::Splat(_) => "splat",
            NodeKind::BlockPass(_) => "block argument",
            NodeKind::KeywordArgs(_) => "keyword arguments",
            NodeKind::Yield(_) => "yield",
            NodeKind::Super(_) => "super",
            NodeKind::And(..) => "and",
            NodeKind::Or(..) => "or",
            NodeKind::If { .. } => "if",
            NodeKind::Unless { .. } => "unless",
            NodeKind::While { .. } => "while",
            NodeKind::Until { .. } => "until",
            NodeKind::Break(_) => "break",
            NodeKind::Next(_) => "next",
            NodeKind::Return(_) => "return",
            NodeKind::Redo => "redo",
            NodeKind::Retry => "retry",
            NodeKind::Case { .. } => "case",
            NodeKind::CaseIn { .. } => "case/in",
            NodeKind::Begin { .. } => "begin",
            NodeKind::Def { .. } => "def",
            NodeKind::Block { .. } => "block",
            NodeKind::Lambda { .. } => "lambda",
            NodeKind::Class { .. } => "class",
            NodeKind::Module { .. } => "module",
            NodeKind::Alias { .. } => "alias",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_of_call() {
        let node = Node::call(Some(Node::lvar("a")), "foo", vec![Node::int(1), Node::int(2)])
            .with_block(Params::default(), Node::nil());
        let children = node.children();
        assert_eq!(children.len(), 4);
        assert_eq!(children[0].type_name(), "local variable");
        assert_eq!(children[3].type_name(), "block");
    }

    #[test]
    fn test_leaf_literals() {
        assert_eq!(Node::int(3).literal(), Some(Literal::Integer(3)));
        assert_eq!(Node::sym("a").literal(), Some(Literal::symbol("a")));
        assert_eq!(Node::lvar("a").literal(), None);
        assert!(Node::int(3).children().is_empty());
    }

    #[test]
    fn test_static_literal_array() {
        let node = Node::new(NodeKind::Array(vec![Node::int(1), Node::sym("b")]));
        assert_eq!(
            node.static_literal(),
            Some(Literal::Array(vec![Literal::Integer(1), Literal::symbol("b")]))
        );

        let dynamic = Node::new(NodeKind::Array(vec![Node::lvar("x")]));
        assert_eq!(dynamic.static_literal(), None);
    }

    #[test]
    fn test_case_in_children_include_pattern_values() {
        let node = Node::new(NodeKind::CaseIn {
            subject: Box::new(Node::lvar("x")),
            clauses: vec![InClause {
                pattern: Pattern::Alternatives(vec![
                    Pattern::Value(Node::int(1)),
                    Pattern::Value(Node::int(2)),
                ]),
                guard: None,
                body: Node::nil(),
            }],
            else_branch: None,
        });
        assert_eq!(node.children().len(), 4);
    }
}
