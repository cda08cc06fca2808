//! WGSL interface scanner.
//!
//! Feedback programs declare stream inputs in group 0 and capture outputs in group 1:
//!
//! ```wgsl
//! @group(0) @binding(0) var<storage, read> position: array<f32>;
//! @group(1) @binding(0) var<storage, read_write> out_position: array<f32>;
//! @compute @workgroup_size(64) fn main(...) { ... }
//! ```
//!
//! Render programs expose attribute locations through `@location(N)` parameters (or
//! struct fields) of their `@vertex` entry point.

use crate::headless::strip_comments;

/// Workgroup size assumed when the source does not state one as a literal.
pub const DEFAULT_WORKGROUP_SIZE: u32 = 64;

/// One `var<storage>` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageVar {
    /// Variable name.
    pub name: String,
    /// `@group` index.
    pub group: u32,
    /// `@binding` index.
    pub binding: u32,
    /// Whether the access mode is `read`.
    pub read_only: bool,
}

/// What a WGSL module exposes to the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WgslInterface {
    /// Storage buffers, in declaration order.
    pub storage: Vec<StorageVar>,
    /// `(name, location)` inputs of the `@vertex` entry point.
    pub vertex_inputs: Vec<(String, u32)>,
    /// Whether the module has a `@compute` entry point.
    pub is_compute: bool,
    /// First `@workgroup_size` dimension.
    pub workgroup_size: u32,
}

impl WgslInterface {
    /// Storage variables of `group`.
    pub fn group(&self, group: u32) -> impl Iterator<Item = &StorageVar> + '_ {
        self.storage.iter().filter(move |var| var.group == group)
    }

    /// Storage variable `name`.
    #[must_use]
    pub fn storage_var(&self, name: &str) -> Option<&StorageVar> {
        self.storage.iter().find(|var| var.name == name)
    }
}

/// Scans `source`.
///
/// # Errors
///
/// A storage declaration without `@group`/`@binding`, or a malformed attribute.
pub fn scan(source: &str) -> Result<WgslInterface, String> {
    let code = strip_comments(source);
    let mut interface = WgslInterface {
        is_compute: code.contains("@compute"),
        workgroup_size: attr_arg(&code, "@workgroup_size")?.unwrap_or(DEFAULT_WORKGROUP_SIZE),
        ..WgslInterface::default()
    };

    for statement in code.split(';') {
        let statement = statement.rsplit('}').next().unwrap_or(statement);
        let Some(var_at) = statement.find("var<storage") else {
            continue;
        };
        let group = attr_arg(statement, "@group")?
            .ok_or_else(|| format!("storage variable without @group: '{}'", statement.trim()))?;
        let binding = attr_arg(statement, "@binding")?
            .ok_or_else(|| format!("storage variable without @binding: '{}'", statement.trim()))?;

        let decl = &statement[var_at + "var<".len()..];
        let close = decl
            .find('>')
            .ok_or_else(|| format!("unterminated address space in '{}'", statement.trim()))?;
        let read_only = decl[..close]
            .split(',')
            .nth(1)
            .map_or(true, |access| access.trim() != "read_write");
        let name = decl[close + 1..]
            .split(':')
            .next()
            .unwrap_or_default()
            .trim()
            .to_owned();
        if name.is_empty() {
            return Err(format!("storage variable without a name: '{}'", statement.trim()));
        }
        interface.storage.push(StorageVar {
            name,
            group,
            binding,
            read_only,
        });
    }

    interface.vertex_inputs = vertex_inputs(&code)?;
    Ok(interface)
}

/// First integer argument of the first `attr(...)` in `text`.
fn attr_arg(text: &str, attr: &str) -> Result<Option<u32>, String> {
    let Some(at) = text.find(attr) else {
        return Ok(None);
    };
    let rest = text[at + attr.len()..].trim_start();
    let Some(args) = rest.strip_prefix('(') else {
        return Err(format!("{attr} without arguments"));
    };
    let first = args
        .split([',', ')'])
        .next()
        .unwrap_or_default()
        .trim()
        .trim_end_matches('u');
    match first.parse() {
        Ok(value) => Ok(Some(value)),
        // Named constants are not resolved.
        Err(_) if attr == "@workgroup_size" => Ok(None),
        Err(_) => Err(format!("bad {attr} argument '{first}'")),
    }
}

/// Splits `text` on commas outside parentheses and angle brackets.
fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' | '<' => depth += 1,
            ')' | '>' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

/// `(name, location)` of a `@location(N) name: type` member, if it is one.
fn located_member(member: &str) -> Result<Option<(String, u32)>, String> {
    let Some(location) = attr_arg(member, "@location")? else {
        return Ok(None);
    };
    let head = member.split(':').next().unwrap_or_default();
    let name = head.split_whitespace().last().unwrap_or_default();
    Ok(Some((name.to_owned(), location)))
}

fn vertex_inputs(code: &str) -> Result<Vec<(String, u32)>, String> {
    let Some(at) = code.find("@vertex") else {
        return Ok(Vec::new());
    };
    let after = &code[at..];
    let Some(open) = after.find('(') else {
        return Ok(Vec::new());
    };
    let mut depth = 0i32;
    let mut close = None;
    for (i, c) in after[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(open + i);
                    break;
                }
            }
            _ => {}
        }
    }
    let close = close.ok_or_else(|| "unterminated @vertex parameter list".to_owned())?;

    let mut inputs = Vec::new();
    for param in split_top_level(&after[open + 1..close]) {
        if let Some(located) = located_member(param)? {
            inputs.push(located);
            continue;
        }
        if param.contains("@builtin") {
            continue;
        }
        let Some(ty) = param.split(':').nth(1).map(str::trim) else {
            continue;
        };
        if let Some(body) = struct_body(code, ty) {
            for field in split_top_level(body) {
                if let Some(located) = located_member(field)? {
                    inputs.push(located);
                }
            }
        }
    }
    Ok(inputs)
}

fn struct_body<'a>(code: &'a str, name: &str) -> Option<&'a str> {
    let mut search = code;
    while let Some(at) = search.find("struct") {
        let rest = &search[at + "struct".len()..];
        let open = rest.find('{')?;
        if rest[..open].trim() == name {
            let body = &rest[open + 1..];
            return body.find('}').map(|end| &body[..end]);
        }
        search = rest;
    }
    None
}
