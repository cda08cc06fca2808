//! GLSL interface scanner.
//!
//! Extracts the `in`/`out` declarations of a vertex-stage source. Only what the headless
//! device needs: float element types, optional `layout(location = N)`, several names per
//! declaration. Everything else (uniforms, function bodies, preprocessor lines) is
//! ignored.

/// One declared stage input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    /// Variable name.
    pub name: String,
    /// Floats per element.
    pub components: u32,
    /// Explicit `layout(location = N)`, if any.
    pub location: Option<u32>,
}

/// Inputs and outputs of one stage, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageInterface {
    /// `in` / `attribute` declarations.
    pub inputs: Vec<Declaration>,
    /// `out` / `varying` declarations.
    pub outputs: Vec<Declaration>,
}

impl StageInterface {
    /// Declared output named `name`.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&Declaration> {
        self.outputs.iter().find(|d| d.name == name)
    }
}

const IGNORED_QUALIFIERS: [&str; 8] = [
    "flat",
    "smooth",
    "noperspective",
    "centroid",
    "invariant",
    "highp",
    "mediump",
    "lowp",
];

/// Scans `source`.
///
/// # Errors
///
/// Returns a compiler-style message for a malformed `layout` qualifier or an interface
/// variable whose type is not `float`/`vec2`/`vec3`/`vec4`.
pub fn scan(source: &str) -> Result<StageInterface, String> {
    let code = strip_comments(source);
    let code: String = code
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n");

    let mut interface = StageInterface::default();
    for statement in code.split(';') {
        // Drop any function body that ends right before the declaration.
        let statement = statement.rsplit('}').next().unwrap_or(statement);
        let (location, rest) = split_layout(statement.trim())?;
        let mut tokens = rest
            .split_whitespace()
            .filter(|t| !IGNORED_QUALIFIERS.contains(t));

        let is_input = match tokens.next() {
            Some("in" | "attribute") => true,
            Some("out" | "varying") => false,
            _ => continue,
        };
        let Some(ty) = tokens.next() else { continue };
        let names: String = tokens.collect::<Vec<_>>().join(" ");

        let components = match ty {
            "float" => 1,
            "vec2" => 2,
            "vec3" => 3,
            "vec4" => 4,
            other => {
                return Err(format!("unsupported interface type '{other}' in '{}'", rest.trim()));
            }
        };

        for (i, name) in names.split(',').map(str::trim).enumerate() {
            if !is_identifier(name) {
                return Err(format!("bad interface variable name '{name}'"));
            }
            let location = location.map(|l| l + u32::try_from(i).unwrap_or(0));
            let declaration = Declaration {
                name: name.to_owned(),
                components,
                location,
            };
            if is_input {
                interface.inputs.push(declaration);
            } else {
                interface.outputs.push(declaration);
            }
        }
    }
    Ok(interface)
}

/// Removes `//` and `/* */` comments.
pub(crate) fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    loop {
        let line = rest.find("//");
        let block = rest.find("/*");
        match (line, block) {
            (Some(l), b) if b.map_or(true, |b| l < b) => {
                out.push_str(&rest[..l]);
                rest = rest[l..].find('\n').map_or("", |end| &rest[l + end..]);
            }
            (_, Some(b)) => {
                out.push_str(&rest[..b]);
                out.push(' ');
                rest = rest[b + 2..].find("*/").map_or("", |end| &rest[b + 2 + end + 2..]);
            }
            _ => {
                out.push_str(rest);
                return out;
            }
        }
    }
}

/// Splits a leading `layout(...)` off a statement and returns its location.
fn split_layout(statement: &str) -> Result<(Option<u32>, &str), String> {
    let Some(after) = statement.strip_prefix("layout") else {
        return Ok((None, statement));
    };
    let after = after.trim_start();
    let Some(inner) = after.strip_prefix('(') else {
        return Ok((None, statement));
    };
    let close = inner
        .find(')')
        .ok_or_else(|| format!("unterminated layout qualifier in '{statement}'"))?;

    let mut location = None;
    for part in inner[..close].split(',') {
        if let Some((key, value)) = part.split_once('=') {
            if key.trim() == "location" {
                let value = value.trim();
                location = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| format!("bad location '{value}'"))?,
                );
            }
        }
    }
    Ok((location, &inner[close + 1..]))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
