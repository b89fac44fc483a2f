//! Arithmetic/bitwise formula interpreter for custom PID formulas
//!
//! Two operand notations are understood:
//! - indexed: `B<i>` is byte `i`, `[B<i>:B<j>]` is the big-endian span `i..=j`
//! - symbolic: `A`, `B`, `C`, `D` are the first four payload bytes
//!
//! Evaluation reduces the innermost parenthesised group first, then operators
//! in three fixed tiers (shift, then mul/div, then add/sub), always taking the
//! leftmost operator of the current tier. Division by zero yields 0 and a
//! malformed formula yields 0. An operand that is not present in the response
//! yields NaN, which propagates through every operator.

/// Operand values available to a formula
#[derive(Debug, Clone, Copy)]
pub enum Bindings<'a> {
    /// Absolute byte indices into the response
    Indexed(&'a [u8]),
    /// `A`..`D` bound to the first four payload bytes (absent ones unbound)
    Symbolic([Option<u8>; 4]),
}

impl<'a> Bindings<'a> {
    /// Bind `A`..`D` to the bytes of `payload`
    pub fn symbolic(payload: &[u8]) -> Self {
        let mut vars = [None; 4];
        for (slot, byte) in vars.iter_mut().zip(payload.iter()) {
            *slot = Some(*byte);
        }
        Bindings::Symbolic(vars)
    }
}

/// Whether the formula addresses bytes by absolute index
pub fn is_indexed_notation(formula: &str) -> bool {
    let chars: Vec<char> = formula.chars().collect();
    formula.contains('[')
        || chars
            .windows(2)
            .any(|w| w[0].eq_ignore_ascii_case(&'B') && w[1].is_ascii_digit())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Shl,
    Shr,
    Mul,
    Div,
    Add,
    Sub,
}

impl Op {
    fn tier(self) -> u8 {
        match self {
            Op::Shl | Op::Shr => 0,
            Op::Mul | Op::Div => 1,
            Op::Add | Op::Sub => 2,
        }
    }

    fn apply(self, a: f64, b: f64) -> f64 {
        if a.is_nan() || b.is_nan() {
            return f64::NAN;
        }
        match self {
            Op::Shl | Op::Shr => {
                let lhs = a.trunc() as i64;
                let rhs = b.trunc() as i64;
                if !(0..64).contains(&rhs) {
                    return 0.0;
                }
                let shift = rhs as u32;
                let out = match self {
                    Op::Shl => lhs.wrapping_shl(shift),
                    _ => lhs >> shift,
                };
                out as f64
            }
            Op::Mul => a * b,
            Op::Div => {
                if b == 0.0 {
                    0.0
                } else {
                    a / b
                }
            }
            Op::Add => a + b,
            Op::Sub => a - b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    Op(Op),
    Open,
    Close,
}

/// Evaluate `formula` against `bindings`
pub fn evaluate(formula: &str, bindings: &Bindings<'_>) -> f64 {
    tokenize(formula, bindings)
        .and_then(reduce)
        .unwrap_or(0.0)
}

fn tokenize(formula: &str, bindings: &Bindings<'_>) -> Option<Vec<Token>> {
    let chars: Vec<char> = formula.chars().filter(|c| !c.is_whitespace()).collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let expects_operand = matches!(tokens.last(), None | Some(Token::Op(_)) | Some(Token::Open));

        match c {
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '-' if expects_operand => {
                // Unary minus binds to the next operand
                tokens.push(Token::Num(-1.0));
                tokens.push(Token::Op(Op::Mul));
                i += 1;
            }
            '+' => {
                tokens.push(Token::Op(Op::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op(Op::Sub));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op(Op::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op(Op::Div));
                i += 1;
            }
            '<' | '>' => {
                if chars.get(i + 1) != Some(&c) {
                    return None;
                }
                tokens.push(Token::Op(if c == '<' { Op::Shl } else { Op::Shr }));
                i += 2;
            }
            '[' => {
                let end = chars[i..].iter().position(|&ch| ch == ']')? + i;
                let inner: String = chars[i + 1..end].iter().collect();
                tokens.push(Token::Num(span_value(&inner, bindings)?));
                i = end + 1;
            }
            '0' if matches!(chars.get(i + 1), Some('x') | Some('X')) => {
                let start = i + 2;
                let mut end = start;
                while end < chars.len() && chars[end].is_ascii_hexdigit() {
                    end += 1;
                }
                let digits: String = chars[start..end].iter().collect();
                tokens.push(Token::Num(u64::from_str_radix(&digits, 16).ok()? as f64));
                i = end;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                tokens.push(Token::Num(literal.parse().ok()?));
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push(Token::Num(operand_value(&ident, bindings)?));
            }
            _ => return None,
        }
    }

    Some(tokens)
}

/// Value of an identifier; `None` when the identifier is not valid at all
fn operand_value(ident: &str, bindings: &Bindings<'_>) -> Option<f64> {
    let upper = ident.to_ascii_uppercase();
    match bindings {
        Bindings::Indexed(bytes) => {
            let index: usize = upper.strip_prefix('B')?.parse().ok()?;
            Some(bytes.get(index).map_or(f64::NAN, |b| f64::from(*b)))
        }
        Bindings::Symbolic(vars) => {
            let slot = match upper.as_str() {
                "A" => 0,
                "B" => 1,
                "C" => 2,
                "D" => 3,
                _ => return None,
            };
            Some(vars[slot].map_or(f64::NAN, f64::from))
        }
    }
}

/// Big-endian value of `B<i>:B<j>`
fn span_value(inner: &str, bindings: &Bindings<'_>) -> Option<f64> {
    let (from, to) = inner.split_once(':')?;
    let parse_index = |s: &str| -> Option<usize> {
        let s = s.trim();
        s.strip_prefix('B')
            .or_else(|| s.strip_prefix('b'))?
            .parse()
            .ok()
    };
    let (from, to) = (parse_index(from)?, parse_index(to)?);
    if from > to {
        return None;
    }
    let Bindings::Indexed(bytes) = bindings else {
        return None;
    };
    if to >= bytes.len() {
        return Some(f64::NAN);
    }
    Some(
        bytes[from..=to]
            .iter()
            .fold(0.0, |acc, b| acc * 256.0 + f64::from(*b)),
    )
}

fn reduce(mut tokens: Vec<Token>) -> Option<f64> {
    loop {
        let close = tokens.iter().position(|t| *t == Token::Close);
        let Some(close) = close else { break };
        let open = tokens[..close].iter().rposition(|t| *t == Token::Open)?;
        let value = reduce_flat(tokens[open + 1..close].to_vec())?;
        tokens.drain(open + 1..=close);
        tokens[open] = Token::Num(value);
    }
    if tokens.contains(&Token::Open) {
        return None;
    }
    reduce_flat(tokens)
}

fn reduce_flat(mut tokens: Vec<Token>) -> Option<f64> {
    for tier in 0..=2 {
        while let Some(i) = tokens
            .iter()
            .position(|t| matches!(t, Token::Op(op) if op.tier() == tier))
        {
            if i == 0 {
                return None;
            }
            let (Token::Num(a), Token::Op(op), Some(Token::Num(b))) =
                (tokens[i - 1], tokens[i], tokens.get(i + 1).copied())
            else {
                return None;
            };
            tokens.drain(i..=i + 1);
            tokens[i - 1] = Token::Num(op.apply(a, b));
        }
    }
    match tokens.as_slice() {
        [Token::Num(v)] => Some(*v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(a: u8, b: u8) -> Bindings<'static> {
        Bindings::Symbolic([Some(a), Some(b), None, None])
    }

    #[test]
    fn symbolic_two_byte_scaling() {
        // (10 * 256 + 200) / 10
        assert_eq!(evaluate("(A*256+B)/10", &sym(10, 200)), 276.0);
    }

    #[test]
    fn precedence_tiers() {
        let none = Bindings::Indexed(&[]);
        assert_eq!(evaluate("2+3*4", &none), 14.0);
        assert_eq!(evaluate("1<<4+1", &none), 17.0);
        assert_eq!(evaluate("8/2*3", &none), 12.0);
        assert_eq!(evaluate("10-4-3", &none), 3.0);
        assert_eq!(evaluate("((2+3))*2", &none), 10.0);
    }

    #[test]
    fn shifts_truncate_operands() {
        let none = Bindings::Indexed(&[]);
        assert_eq!(evaluate("7.9>>1", &none), 3.0);
        assert_eq!(evaluate("1.5<<2", &none), 4.0);
    }

    #[test]
    fn division_by_zero_is_zero() {
        let none = Bindings::Indexed(&[]);
        assert_eq!(evaluate("5/0", &none), 0.0);
        assert_eq!(evaluate("5/(2-2)+1", &none), 1.0);
    }

    #[test]
    fn malformed_is_zero() {
        let none = Bindings::Indexed(&[]);
        assert_eq!(evaluate("2+", &none), 0.0);
        assert_eq!(evaluate("(2+3", &none), 0.0);
        assert_eq!(evaluate("2+3)", &none), 0.0);
        assert_eq!(evaluate("()", &none), 0.0);
        assert_eq!(evaluate("2 % 3", &none), 0.0);
        assert_eq!(evaluate("Q*2", &none), 0.0);
    }

    #[test]
    fn unary_minus() {
        let none = Bindings::Indexed(&[]);
        assert_eq!(evaluate("-5+2", &none), -3.0);
        assert_eq!(evaluate("2*-(3+1)", &none), -8.0);
        assert_eq!(evaluate("A-40", &sym(20, 0)), -20.0);
    }

    #[test]
    fn indexed_bytes_and_spans() {
        let bytes = [0x62, 0x01, 0x01, 0x0D, 0xAC, 0x00];
        let b = Bindings::Indexed(&bytes);
        assert_eq!(evaluate("B3", &b), 13.0);
        assert_eq!(evaluate("[B3:B4]/10", &b), 350.0);
        assert_eq!(evaluate("[B1:B2]", &b), 257.0);
        assert_eq!(evaluate("0x10+B5", &b), 16.0);
    }

    #[test]
    fn signed_sixteen_bit_idiom() {
        let bytes = [0xFF, 0x9C];
        let b = Bindings::Indexed(&bytes);
        assert_eq!(evaluate("[B0:B1]-65536*(B0>>7)", &b), -100.0);
    }

    #[test]
    fn unbound_operand_is_nan() {
        let bytes = [1u8, 2];
        assert!(evaluate("B7*2", &Bindings::Indexed(&bytes)).is_nan());
        assert!(evaluate("[B1:B4]", &Bindings::Indexed(&bytes)).is_nan());
        assert!(evaluate("C+1", &sym(1, 2)).is_nan());
        assert!(evaluate("C/0", &sym(1, 2)).is_nan());
    }

    #[test]
    fn notation_detection() {
        assert!(is_indexed_notation("B4*2"));
        assert!(is_indexed_notation("[B4:B5]"));
        assert!(!is_indexed_notation("(A*256+B)/4"));
        assert!(!is_indexed_notation("B-40"));
    }
}
