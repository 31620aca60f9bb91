//! Parsing of bracket-notation addresses such as `"DB".arr[2].x`.

use std::fmt;

/// One step of a parsed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Object member, quotes included.
    Member(String),
    /// Array index.
    Index(usize),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Member(name) => f.write_str(name),
            Step::Index(index) => write!(f, "[{index}]"),
        }
    }
}

/// Splits an address into steps.
///
/// Dots and brackets inside double quotes are part of the member name.
pub fn parse_address(address: &str) -> Result<Vec<Step>, String> {
    let mut steps = Vec::new();
    let mut member = String::new();
    let mut quoted = false;
    let mut chars = address.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                member.push(c);
            }
            _ if quoted => member.push(c),
            '.' => {
                if member.is_empty() && !matches!(steps.last(), Some(Step::Index(_))) {
                    return Err(format!("empty member in `{address}`"));
                }
                if !member.is_empty() {
                    steps.push(Step::Member(std::mem::take(&mut member)));
                }
            }
            '[' => {
                if !member.is_empty() {
                    steps.push(Step::Member(std::mem::take(&mut member)));
                }
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(d) if d.is_ascii_digit() => digits.push(d),
                        _ => return Err(format!("malformed index in `{address}`")),
                    }
                }
                let index = digits
                    .parse()
                    .map_err(|_| format!("malformed index in `{address}`"))?;
                steps.push(Step::Index(index));
            }
            ']' => return Err(format!("unbalanced `]` in `{address}`")),
            _ => member.push(c),
        }
    }

    if quoted {
        return Err(format!("unbalanced quote in `{address}`"));
    }
    if !member.is_empty() {
        steps.push(Step::Member(member));
    } else if address.ends_with('.') || steps.is_empty() {
        return Err(format!("empty member in `{address}`"));
    }
    Ok(steps)
}
