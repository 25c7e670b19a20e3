//! Two-pass DCPU-16 assembler.
//!
//! Accepts the conventional mnemonic syntax (`SET B, A`, `JSR A`, `DAT`,
//! labels in either `:name` or `name:` form) and produces the image words the
//! emulator loads. Label operands always assemble to a trailing word so that
//! instruction sizes are known before symbols resolve; short numeric literals
//! in the A slot use the inline encoding.

use std::collections::HashMap;

use thiserror::Error;

/// Errors surfaced while assembling a source listing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AsmError {
    #[error("line {line}: unknown mnemonic '{mnemonic}'")]
    UnknownMnemonic { line: usize, mnemonic: String },
    #[error("line {line}: malformed operand '{operand}'")]
    BadOperand { line: usize, operand: String },
    #[error("line {line}: expected {expected} operand(s), found {found}")]
    OperandCount {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("line {line}: operand form is not writable in the B slot")]
    LiteralDestination { line: usize },
    #[error("line {line}: duplicate label '{label}'")]
    DuplicateLabel { line: usize, label: String },
    #[error("line {line}: undefined label '{label}'")]
    UndefinedLabel { line: usize, label: String },
    #[error("line {line}: value {value} does not fit in 16 bits")]
    ValueRange { line: usize, value: i64 },
    #[error("program exceeds the 65536-word address space")]
    ProgramTooLarge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Num(u16),
    Sym(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OperandAst {
    Reg(u8),
    Ind(u8),
    IndOffset(u8, Expr),
    PushPop,
    Peek,
    Pick(Expr),
    Sp,
    Pc,
    Ex,
    IndAbs(Expr),
    Imm(Expr),
}

impl OperandAst {
    /// Number of trailing words this operand occupies.
    fn extra_words(&self, is_a: bool) -> usize {
        match self {
            OperandAst::IndOffset(..) | OperandAst::Pick(_) | OperandAst::IndAbs(_) => 1,
            OperandAst::Imm(Expr::Num(value)) if is_a && inline_literal(*value).is_some() => 0,
            OperandAst::Imm(_) => 1,
            _ => 0,
        }
    }

    /// Field code plus optional trailing word, after symbol resolution.
    fn encode(
        &self,
        is_a: bool,
        labels: &HashMap<String, u16>,
        line: usize,
    ) -> Result<(u8, Option<u16>), AsmError> {
        let resolve = |expr: &Expr| -> Result<u16, AsmError> {
            match expr {
                Expr::Num(value) => Ok(*value),
                Expr::Sym(name) => {
                    labels
                        .get(name)
                        .copied()
                        .ok_or_else(|| AsmError::UndefinedLabel {
                            line,
                            label: name.clone(),
                        })
                }
            }
        };
        Ok(match self {
            OperandAst::Reg(index) => (*index, None),
            OperandAst::Ind(index) => (0x08 + *index, None),
            OperandAst::IndOffset(index, expr) => (0x10 + *index, Some(resolve(expr)?)),
            OperandAst::PushPop => (0x18, None),
            OperandAst::Peek => (0x19, None),
            OperandAst::Pick(expr) => (0x1A, Some(resolve(expr)?)),
            OperandAst::Sp => (0x1B, None),
            OperandAst::Pc => (0x1C, None),
            OperandAst::Ex => (0x1D, None),
            OperandAst::IndAbs(expr) => (0x1E, Some(resolve(expr)?)),
            OperandAst::Imm(expr) => {
                let value = resolve(expr)?;
                match (is_a, self, inline_literal(value)) {
                    (true, OperandAst::Imm(Expr::Num(_)), Some(code)) => (code, None),
                    _ => (0x1F, Some(value)),
                }
            }
        })
    }
}

/// Inline-literal field code for values representable as `code - 0x21`.
fn inline_literal(value: u16) -> Option<u8> {
    if value == 0xFFFF {
        Some(0x20)
    } else if value <= 30 {
        Some(0x21 + value as u8)
    } else {
        None
    }
}

#[derive(Debug)]
enum Item {
    Basic {
        line: usize,
        opcode: u8,
        b: OperandAst,
        a: OperandAst,
    },
    Special {
        line: usize,
        subopcode: u8,
        a: OperandAst,
    },
    Data {
        line: usize,
        values: Vec<Expr>,
    },
}

impl Item {
    fn words(&self) -> usize {
        match self {
            Item::Basic { a, b, .. } => 1 + a.extra_words(true) + b.extra_words(false),
            Item::Special { a, .. } => 1 + a.extra_words(true),
            Item::Data { values, .. } => values.len(),
        }
    }
}

fn basic_opcode(mnemonic: &str) -> Option<u8> {
    Some(match mnemonic {
        "SET" => 0x01,
        "ADD" => 0x02,
        "SUB" => 0x03,
        "MUL" => 0x04,
        "MLI" => 0x05,
        "DIV" => 0x06,
        "DVI" => 0x07,
        "MOD" => 0x08,
        "MDI" => 0x09,
        "AND" => 0x0A,
        "BOR" => 0x0B,
        "XOR" => 0x0C,
        "SHR" => 0x0D,
        "ASR" => 0x0E,
        "SHL" => 0x0F,
        "IFB" => 0x10,
        "IFC" => 0x11,
        "IFE" => 0x12,
        "IFN" => 0x13,
        "IFG" => 0x14,
        "IFA" => 0x15,
        "IFL" => 0x16,
        "IFU" => 0x17,
        "ADX" => 0x1A,
        "SBX" => 0x1B,
        "STI" => 0x1E,
        "STD" => 0x1F,
        _ => return None,
    })
}

fn special_opcode(mnemonic: &str) -> Option<u8> {
    Some(match mnemonic {
        "JSR" => 0x01,
        "INT" => 0x08,
        "IAG" => 0x09,
        "IAS" => 0x0A,
        "RFI" => 0x0B,
        "IAQ" => 0x0C,
        "HWN" => 0x10,
        "HWQ" => 0x11,
        "HWI" => 0x12,
        _ => return None,
    })
}

fn register_index(name: &str) -> Option<u8> {
    Some(match name {
        "A" => 0,
        "B" => 1,
        "C" => 2,
        "X" => 3,
        "Y" => 4,
        "Z" => 5,
        "I" => 6,
        "J" => 7,
        _ => return None,
    })
}

fn parse_number(token: &str, line: usize) -> Result<u16, AsmError> {
    let (digits, negative) = match token.strip_prefix('-') {
        Some(rest) => (rest, true),
        None => (token, false),
    };
    let parsed = if let Some(hex) = digits.strip_prefix("0X") {
        i64::from_str_radix(hex, 16)
    } else {
        digits.parse::<i64>()
    }
    .map_err(|_| AsmError::BadOperand {
        line,
        operand: token.to_string(),
    })?;
    let value = if negative { -parsed } else { parsed };
    if !(-0x8000..=0xFFFF).contains(&value) {
        return Err(AsmError::ValueRange { line, value });
    }
    Ok(value as u16)
}

fn parse_expr(token: &str, line: usize) -> Result<Expr, AsmError> {
    let first = token.chars().next().ok_or(AsmError::BadOperand {
        line,
        operand: token.to_string(),
    })?;
    if first.is_ascii_digit() || first == '-' {
        parse_number(token, line).map(Expr::Num)
    } else {
        Ok(Expr::Sym(token.to_string()))
    }
}

fn parse_operand(raw: &str, line: usize) -> Result<OperandAst, AsmError> {
    let token = raw.trim();
    let upper = token.to_ascii_uppercase();
    let bad = || AsmError::BadOperand {
        line,
        operand: token.to_string(),
    };

    match upper.as_str() {
        "PUSH" | "POP" => return Ok(OperandAst::PushPop),
        "PEEK" => return Ok(OperandAst::Peek),
        "SP" => return Ok(OperandAst::Sp),
        "PC" => return Ok(OperandAst::Pc),
        "EX" => return Ok(OperandAst::Ex),
        _ => {}
    }
    if let Some(depth) = upper.strip_prefix("PICK") {
        return Ok(OperandAst::Pick(parse_expr(depth.trim(), line)?));
    }
    if let Some(index) = register_index(&upper) {
        return Ok(OperandAst::Reg(index));
    }
    if upper.starts_with('[') {
        let inner = upper
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(bad)?
            .trim()
            .to_string();
        if let Some(index) = register_index(&inner) {
            return Ok(OperandAst::Ind(index));
        }
        if let Some((lhs, rhs)) = inner.split_once('+') {
            let (lhs, rhs) = (lhs.trim(), rhs.trim());
            // Accept the offset on either side of the register.
            return if let Some(index) = register_index(lhs) {
                Ok(OperandAst::IndOffset(index, parse_expr(rhs, line)?))
            } else if let Some(index) = register_index(rhs) {
                Ok(OperandAst::IndOffset(index, parse_expr(lhs, line)?))
            } else {
                Err(bad())
            };
        }
        return Ok(OperandAst::IndAbs(parse_expr(&inner, line)?));
    }
    Ok(OperandAst::Imm(parse_expr(&upper, line)?))
}

fn split_operands(rest: &str) -> Vec<&str> {
    rest.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect()
}

/// Assemble a source listing into image words.
pub fn assemble(source: &str) -> Result<Vec<u16>, AsmError> {
    let mut items = Vec::new();
    let mut labels: HashMap<String, u16> = HashMap::new();
    let mut origin = 0usize;

    for (index, raw_line) in source.lines().enumerate() {
        let line = index + 1;
        let mut text = raw_line;
        if let Some(comment) = text.find(';') {
            text = &text[..comment];
        }
        let mut text = text.trim();

        // Leading labels, in either `:name` or `name:` spelling.
        loop {
            if let Some(rest) = text.strip_prefix(':') {
                let end = rest
                    .find(|c: char| c.is_whitespace())
                    .unwrap_or(rest.len());
                let (name, tail) = rest.split_at(end);
                define_label(&mut labels, name, origin, line)?;
                text = tail.trim_start();
            } else if let Some(colon) = text.find(':') {
                let (name, tail) = text.split_at(colon);
                if name.is_empty() || name.contains(char::is_whitespace) {
                    break;
                }
                define_label(&mut labels, name, origin, line)?;
                text = tail[1..].trim_start();
            } else {
                break;
            }
        }
        if text.is_empty() {
            continue;
        }

        let (mnemonic, rest) = match text.find(char::is_whitespace) {
            Some(split) => text.split_at(split),
            None => (text, ""),
        };
        let mnemonic = mnemonic.to_ascii_uppercase();
        let operands = split_operands(rest);

        let item = if mnemonic == "DAT" {
            let mut values = Vec::new();
            for token in &operands {
                values.push(parse_expr(&token.to_ascii_uppercase(), line)?);
            }
            Item::Data { line, values }
        } else if let Some(opcode) = basic_opcode(&mnemonic) {
            if operands.len() != 2 {
                return Err(AsmError::OperandCount {
                    line,
                    expected: 2,
                    found: operands.len(),
                });
            }
            let b = parse_operand(operands[0], line)?;
            let a = parse_operand(operands[1], line)?;
            if matches!(b, OperandAst::Imm(Expr::Num(_))) {
                return Err(AsmError::LiteralDestination { line });
            }
            Item::Basic { line, opcode, b, a }
        } else if let Some(subopcode) = special_opcode(&mnemonic) {
            if operands.len() != 1 {
                return Err(AsmError::OperandCount {
                    line,
                    expected: 1,
                    found: operands.len(),
                });
            }
            let a = parse_operand(operands[0], line)?;
            Item::Special {
                line,
                subopcode,
                a,
            }
        } else {
            return Err(AsmError::UnknownMnemonic {
                line,
                mnemonic: mnemonic.to_string(),
            });
        };

        origin += item.words();
        if origin > 0x10000 {
            return Err(AsmError::ProgramTooLarge);
        }
        items.push(item);
    }

    let mut words = Vec::with_capacity(origin);
    for item in &items {
        match item {
            Item::Basic {
                line,
                opcode,
                b,
                a,
            } => {
                let (a_code, a_word) = a.encode(true, &labels, *line)?;
                let (b_code, b_word) = b.encode(false, &labels, *line)?;
                words.push(u16::from(*opcode) | u16::from(b_code) << 5 | u16::from(a_code) << 10);
                words.extend(a_word);
                words.extend(b_word);
            }
            Item::Special {
                line,
                subopcode,
                a,
            } => {
                let (a_code, a_word) = a.encode(true, &labels, *line)?;
                words.push(u16::from(*subopcode) << 5 | u16::from(a_code) << 10);
                words.extend(a_word);
            }
            Item::Data { line, values } => {
                for expr in values {
                    match expr {
                        Expr::Num(value) => words.push(*value),
                        Expr::Sym(name) => words.push(
                            labels
                                .get(name)
                                .copied()
                                .ok_or_else(|| AsmError::UndefinedLabel {
                                    line: *line,
                                    label: name.clone(),
                                })?,
                        ),
                    }
                }
            }
        }
    }
    Ok(words)
}

fn define_label(
    labels: &mut HashMap<String, u16>,
    name: &str,
    origin: usize,
    line: usize,
) -> Result<(), AsmError> {
    let key = name.to_ascii_uppercase();
    if labels.insert(key, origin as u16).is_some() {
        return Err(AsmError::DuplicateLabel {
            line,
            label: name.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_register_inline_literal() {
        // 30 is the top of the inline range: a single word, code 0x21 + 30.
        assert_eq!(assemble("SET A, 30").unwrap(), vec![(0x21 + 30) << 10 | 0x01]);
    }

    #[test]
    fn set_register_wide_literal() {
        // SET A, 0x30 exceeds the inline range and takes a trailing word.
        assert_eq!(assemble("SET A, 0x30").unwrap(), vec![0x7C01, 0x0030]);
    }

    #[test]
    fn indirect_offset_accepts_both_orders() {
        let lhs = assemble("SET [A+1], 0x100").unwrap();
        let rhs = assemble("SET [1+A], 0x100").unwrap();
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn labels_resolve_forward_and_back() {
        let words = assemble(
            ":start SET PC, end\n\
             DAT 0xDEAD\n\
             :end SET PC, start\n",
        )
        .unwrap();
        // Label operands always use the trailing-word literal form.
        assert_eq!(words[1], 3, "forward reference to :end");
        assert_eq!(words[2], 0xDEAD);
        assert_eq!(words[4], 0, "back reference to :start");
    }

    #[test]
    fn special_instructions_encode_in_the_b_field() {
        let words = assemble("JSR 0x100").unwrap();
        assert_eq!(words, vec![0x01 << 5 | 0x1F << 10, 0x0100]);
    }

    #[test]
    fn unknown_mnemonic_is_reported_with_line() {
        let err = assemble("SET A, 1\nFROB A, B\n").unwrap_err();
        assert_eq!(
            err,
            AsmError::UnknownMnemonic {
                line: 2,
                mnemonic: "FROB".into()
            }
        );
    }

    #[test]
    fn literal_destination_is_rejected() {
        assert_eq!(
            assemble("SET 5, A").unwrap_err(),
            AsmError::LiteralDestination { line: 1 }
        );
    }

    #[test]
    fn negative_one_uses_the_short_form() {
        let words = assemble("SET A, -1").unwrap();
        assert_eq!(words, vec![0x20 << 10 | 0x01]);
    }
}
