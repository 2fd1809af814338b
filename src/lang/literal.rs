use serde::{Deserialize, Serialize};

/// Compile-time constant value.
///
/// Literals appear in three places: as leaf values of syntax tree nodes, as
/// operands of instructions (`putobject`, `duparray`, ...), and as the
/// building blocks of the serialized instruction sequence format, which is
/// itself a nested tree of arrays, hashes, symbols and scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    /// `nil`
    Nil,

    /// `true`
    True,

    /// `false`
    False,

    /// 64-bit signed integer.
    Integer(i64),

    /// 64-bit floating-point number.
    Float(f64),

    /// UTF-8 string.
    String(String),

    /// Interned name: `:foo`.
    Symbol(String),

    /// Array of literals: `[1, :a, nil]`.
    Array(Vec<Literal>),

    /// Ordered hash of literal pairs: `{ a: 1 }`.
    Hash(Vec<(Literal, Literal)>),

    /// Range with literal bounds: `1..10`, `1...`.
    Range {
        start: Option<Box<Literal>>,
        end: Option<Box<Literal>>,
        exclusive: bool,
    },
}

impl Literal {
    pub fn symbol(name: impl Into<String>) -> Self {
        Literal::Symbol(name.into())
    }

    pub fn string(value: impl Into<String>) -> Self {
        Literal::String(value.into())
    }

    pub fn bool(value: bool) -> Self {
        if value { Literal::True } else { Literal::False }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Literal::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Literal::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Literal]> {
        match self {
            Literal::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_hash(&self) -> Option<&[(Literal, Literal)]> {
        match self {
            Literal::Hash(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// Look up a symbol key in a hash literal.
    pub fn get(&self, key: &str) -> Option<&Literal> {
        self.as_hash()?
            .iter()
            .find(|(k, _)| k.as_symbol() == Some(key))
            .map(|(_, v)| v)
    }

    /// Values that can be embedded as instruction operands without
    /// allocating a mutable object at runtime.
    pub fn is_static(&self) -> bool {
        match self {
            Literal::String(_) => false,
            Literal::Array(items) => items.iter().all(Literal::is_static),
            Literal::Hash(pairs) => pairs.iter().all(|(k, v)| k.is_static() && v.is_static()),
            _ => true,
        }
    }
}

/// Format a float the way the language prints it: `1.0`, `2.5`, `1.0e+20`.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if value.abs() >= 1e16 {
        let raw = format!("{:e}", value);
        let (mantissa, exponent) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
        let mantissa = if mantissa.contains('.') {
            mantissa.to_string()
        } else {
            format!("{}.0", mantissa)
        };
        let exponent = if exponent.starts_with('-') {
            exponent.to_string()
        } else {
            format!("+{}", exponent)
        };
        return format!("{}e{}", mantissa, exponent);
    }
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

/// Quote a string with the escapes the language's `inspect` uses.
pub fn quote_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

impl std::fmt::Display for Literal {
    /// Format a literal using surface syntax (`inspect` form).
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Literal::Nil => write!(f, "nil"),
            Literal::True => write!(f, "true"),
            Literal::False => write!(f, "false"),
            Literal::Integer(n) => write!(f, "{}", n),
            Literal::Float(n) => write!(f, "{}", format_float(*n)),
            Literal::String(s) => write!(f, "{}", quote_string(s)),
            Literal::Symbol(s) => write!(f, ":{}", s),
            Literal::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Literal::Hash(pairs) => {
                if pairs.is_empty() {
                    return write!(f, "{{}}");
                }
                write!(f, "{{")?;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}=>{}", key, value)?;
                }
                write!(f, "}}")
            }
            Literal::Range {
                start,
                end,
                exclusive,
            } => {
                if let Some(start) = start {
                    write!(f, "{}", start)?;
                }
                write!(f, "{}", if *exclusive { "..." } else { ".." })?;
                if let Some(end) = end {
                    write!(f, "{}", end)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_formatting() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(2.5), "2.5");
        assert_eq!(format_float(-3.0), "-3.0");
        assert_eq!(format_float(1e20), "1.0e+20");
        assert_eq!(format_float(f64::INFINITY), "Infinity");
    }

    #[test]
    fn test_inspect_nested() {
        let lit = Literal::Array(vec![
            Literal::Integer(1),
            Literal::string("a\"b"),
            Literal::symbol("c"),
            Literal::Hash(vec![(Literal::symbol("k"), Literal::Nil)]),
        ]);
        assert_eq!(lit.to_string(), "[1, \"a\\\"b\", :c, {:k=>nil}]");
    }

    #[test]
    fn test_range_display() {
        let lit = Literal::Range {
            start: Some(Box::new(Literal::Integer(1))),
            end: None,
            exclusive: true,
        };
        assert_eq!(lit.to_string(), "1...");
    }

    #[test]
    fn test_static_literals() {
        assert!(Literal::Array(vec![Literal::Integer(1), Literal::symbol("a")]).is_static());
        assert!(!Literal::Array(vec![Literal::string("s")]).is_static());
    }

    #[test]
    fn test_hash_get() {
        let lit = Literal::Hash(vec![
            (Literal::symbol("lead_num"), Literal::Integer(2)),
            (Literal::symbol("rest_start"), Literal::Integer(2)),
        ]);
        assert_eq!(lit.get("rest_start"), Some(&Literal::Integer(2)));
        assert_eq!(lit.get("missing"), None);
    }
}
