use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Rule target keyword, first token of every rule line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Allow,
    Block,
    Reject,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Allow => "allow",
            Target::Block => "block",
            Target::Reject => "reject",
        }
    }

    pub fn parse(token: &str) -> Result<Self> {
        match token {
            "allow" => Ok(Target::Allow),
            "block" => Ok(Target::Block),
            "reject" => Ok(Target::Reject),
            other => Err(Error::MalformedRule(format!(
                "unknown rule target: {other}"
            ))),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One USB interface descriptor triple. Subclass and protocol may be
/// wildcards; a wildcard subclass forces a wildcard protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceClass {
    pub base: u8,
    pub sub: Option<u8>,
    pub protocol: Option<u8>,
}

impl InterfaceClass {
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.split(':');
        let (base, sub, protocol) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(b), Some(s), Some(p), None) => (b, s, p),
            _ => {
                return Err(Error::MalformedRule(format!(
                    "interface spec must be base:sub:protocol: {spec}"
                )))
            }
        };
        let base = parse_class_byte(base).ok_or_else(|| {
            Error::MalformedRule(format!("interface base class must be a hex byte: {spec}"))
        })?;
        let sub = parse_wildcard_byte(sub).map_err(|_| {
            Error::MalformedRule(format!("interface subclass must be a hex byte or *: {spec}"))
        })?;
        let protocol = parse_wildcard_byte(protocol).map_err(|_| {
            Error::MalformedRule(format!("interface protocol must be a hex byte or *: {spec}"))
        })?;
        if sub.is_none() && protocol.is_some() {
            return Err(Error::MalformedRule(format!(
                "interface protocol must be * when subclass is *: {spec}"
            )));
        }
        Ok(InterfaceClass {
            base,
            sub,
            protocol,
        })
    }

    /// Drops subclass and protocol to wildcards, keeping only the base class.
    pub fn masked(&self) -> Self {
        InterfaceClass {
            base: self.base,
            sub: None,
            protocol: None,
        }
    }
}

impl fmt::Display for InterfaceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:", self.base)?;
        match self.sub {
            Some(sub) => write!(f, "{sub:02x}:")?,
            None => f.write_str("*:")?,
        }
        match self.protocol {
            Some(protocol) => write!(f, "{protocol:02x}"),
            None => f.write_str("*"),
        }
    }
}

fn parse_class_byte(token: &str) -> Option<u8> {
    if token.len() != 2 {
        return None;
    }
    u8::from_str_radix(token, 16).ok()
}

fn parse_wildcard_byte(token: &str) -> std::result::Result<Option<u8>, ()> {
    if token == "*" {
        return Ok(None);
    }
    parse_class_byte(token).map(Some).ok_or(())
}

/// One parsed policy rule. `number` is the 1-based rule-file line position;
/// it is set only by the file parser, never by `parse` itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub target: Target,
    pub name: Option<String>,
    pub vid: Option<String>,
    pub pid: Option<String>,
    pub serial: Option<String>,
    pub hash: Option<String>,
    pub parent_hash: Option<String>,
    pub via_port: Option<String>,
    pub connect_type: Option<String>,
    pub interfaces: Vec<InterfaceClass>,
    pub condition: Option<String>,
    pub number: Option<usize>,
}

impl Rule {
    pub fn new(target: Target) -> Rule {
        Rule {
            target,
            name: None,
            vid: None,
            pid: None,
            serial: None,
            hash: None,
            parent_hash: None,
            via_port: None,
            connect_type: None,
            interfaces: Vec::new(),
            condition: None,
            number: None,
        }
    }

    pub fn parse(raw: &str) -> Result<Rule> {
        let tokens = tokenize(raw)?;
        let mut iter = tokens.into_iter();

        let first = iter
            .next()
            .ok_or_else(|| Error::MalformedRule("empty rule".to_string()))?;
        if first.quoted {
            return Err(Error::MalformedRule(
                "rule must start with a target keyword".to_string(),
            ));
        }
        let mut rule = Rule::new(Target::parse(&first.text)?);

        while let Some(token) = iter.next() {
            if token.quoted {
                return Err(Error::MalformedRule(format!(
                    "expected a keyword, found quoted string: \"{}\"",
                    token.text
                )));
            }
            match token.text.as_str() {
                "name" => rule.name = Some(take_value(&mut iter, "name")?),
                "serial" => rule.serial = Some(take_value(&mut iter, "serial")?),
                "hash" => rule.hash = Some(take_value(&mut iter, "hash")?),
                "parent-hash" => rule.parent_hash = Some(take_value(&mut iter, "parent-hash")?),
                "via-port" => rule.via_port = Some(take_value(&mut iter, "via-port")?),
                "with-connect-type" => {
                    rule.connect_type = Some(take_value(&mut iter, "with-connect-type")?)
                }
                "id" => {
                    let value = take_value(&mut iter, "id")?;
                    let (vid, pid) = value.split_once(':').ok_or_else(|| {
                        Error::MalformedRule(format!("device id must be vid:pid: {value}"))
                    })?;
                    if !is_id_field(vid) || !is_id_field(pid) {
                        return Err(Error::MalformedRule(format!(
                            "device id fields must be hex or *: {value}"
                        )));
                    }
                    rule.vid = Some(vid.to_string());
                    rule.pid = Some(pid.to_string());
                }
                "with-interface" => rule.interfaces = take_interfaces(&mut iter)?,
                "if" => {
                    let rest: Vec<String> = iter.map(|t| t.text).collect();
                    if rest.is_empty() {
                        return Err(Error::MalformedRule(
                            "missing condition after if".to_string(),
                        ));
                    }
                    rule.condition = Some(rest.join(" "));
                    break;
                }
                other => {
                    return Err(Error::MalformedRule(format!(
                        "unrecognized keyword: {other}"
                    )))
                }
            }
        }
        Ok(rule)
    }

    /// Canonical single-line textual form. The rule file is written with
    /// `with_number == false`; the number prefix is for listings only.
    pub fn build_string(&self, with_number: bool, with_hash: bool) -> String {
        let mut out = String::new();
        if with_number {
            if let Some(number) = self.number {
                out.push_str(&number.to_string());
                out.push_str(": ");
            }
        }
        out.push_str(self.target.as_str());
        if let Some(name) = &self.name {
            out.push_str(" name ");
            push_quoted(&mut out, name);
        }
        if let Some(vid) = &self.vid {
            out.push_str(" id ");
            out.push_str(vid);
            out.push(':');
            out.push_str(self.pid.as_deref().unwrap_or("*"));
        }
        if let Some(serial) = &self.serial {
            out.push_str(" serial ");
            push_quoted(&mut out, serial);
        }
        if with_hash {
            if let Some(hash) = &self.hash {
                out.push_str(" hash ");
                push_quoted(&mut out, hash);
            }
            if let Some(parent_hash) = &self.parent_hash {
                out.push_str(" parent-hash ");
                push_quoted(&mut out, parent_hash);
            }
        }
        if let Some(via_port) = &self.via_port {
            out.push_str(" via-port ");
            push_quoted(&mut out, via_port);
        }
        if let Some(connect_type) = &self.connect_type {
            out.push_str(" with-connect-type ");
            push_quoted(&mut out, connect_type);
        }
        match self.interfaces.len() {
            0 => {}
            1 => {
                out.push_str(" with-interface ");
                out.push_str(&self.interfaces[0].to_string());
            }
            _ => {
                out.push_str(" with-interface { ");
                for interface in &self.interfaces {
                    out.push_str(&interface.to_string());
                    out.push(' ');
                }
                out.push('}');
            }
        }
        if let Some(condition) = &self.condition {
            out.push_str(" if ");
            out.push_str(condition);
        }
        out
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build_string(false, true))
    }
}

fn push_quoted(out: &mut String, value: &str) {
    out.push('"');
    out.push_str(value);
    out.push('"');
}

fn is_id_field(token: &str) -> bool {
    if token == "*" {
        return true;
    }
    !token.is_empty()
        && token.len() <= 4
        && token.chars().all(|ch| ch.is_ascii_hexdigit())
}

/// Folds a `with-interface` specifier list into the minimal set of match
/// strings. Specifiers sharing a base class collapse to `base:*:*` so one
/// rule still matches a device exposing several interfaces of that class;
/// a base with a single specifier keeps its concrete form. Emission order
/// follows first occurrence of each base class. Non-braced input is
/// returned unchanged as a single element.
pub fn fold_interface_list(raw: &str) -> Vec<String> {
    let mut spec = raw.trim();
    if let Some(stripped) = spec.strip_prefix("with-interface") {
        spec = stripped.trim_start();
    }
    if !(spec.contains('{') && spec.contains('}')) {
        return vec![spec.to_string()];
    }

    let inner: String = spec.chars().filter(|ch| *ch != '{' && *ch != '}').collect();
    let parsed: Vec<InterfaceClass> = inner
        .split_whitespace()
        .filter_map(|token| InterfaceClass::parse(token).ok())
        .collect();

    let mut seen: Vec<u8> = Vec::new();
    let mut out = Vec::new();
    for interface in &parsed {
        if seen.contains(&interface.base) {
            continue;
        }
        seen.push(interface.base);
        let shared = parsed.iter().filter(|i| i.base == interface.base).count();
        if shared == 1 {
            out.push(interface.to_string());
        } else {
            out.push(interface.masked().to_string());
        }
    }
    out
}

struct Token {
    text: String,
    quoted: bool,
}

fn tokenize(raw: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch.is_whitespace() {
            continue;
        }
        if ch == '"' {
            let mut text = String::new();
            let mut terminated = false;
            for inner in chars.by_ref() {
                if inner == '"' {
                    terminated = true;
                    break;
                }
                text.push(inner);
            }
            if !terminated {
                return Err(Error::MalformedRule("unterminated quote".to_string()));
            }
            tokens.push(Token { text, quoted: true });
            continue;
        }
        if ch == '{' || ch == '}' {
            tokens.push(Token {
                text: ch.to_string(),
                quoted: false,
            });
            continue;
        }
        let mut text = String::from(ch);
        while let Some(next) = chars.peek() {
            if next.is_whitespace() || *next == '{' || *next == '}' || *next == '"' {
                break;
            }
            text.push(*next);
            chars.next();
        }
        tokens.push(Token {
            text,
            quoted: false,
        });
    }
    Ok(tokens)
}

fn take_value<I>(iter: &mut I, key: &str) -> Result<String>
where
    I: Iterator<Item = Token>,
{
    match iter.next() {
        Some(token) if token.quoted || (token.text != "{" && token.text != "}") => Ok(token.text),
        _ => Err(Error::MalformedRule(format!("missing value after {key}"))),
    }
}

fn take_interfaces<I>(iter: &mut I) -> Result<Vec<InterfaceClass>>
where
    I: Iterator<Item = Token>,
{
    let first = iter
        .next()
        .ok_or_else(|| Error::MalformedRule("missing value after with-interface".to_string()))?;
    if first.text != "{" {
        return Ok(vec![InterfaceClass::parse(&first.text)?]);
    }
    let mut interfaces = Vec::new();
    loop {
        let token = iter.next().ok_or_else(|| {
            Error::MalformedRule("unterminated interface list".to_string())
        })?;
        if token.text == "}" && !token.quoted {
            break;
        }
        interfaces.push(InterfaceClass::parse(&token.text)?);
    }
    if interfaces.is_empty() {
        return Err(Error::MalformedRule("empty interface list".to_string()));
    }
    Ok(interfaces)
}
