//! Line-oriented emitter for `nft -f` input.
//!
//! The builder produces one totally-ordered script per apply so the reader
//! never has to reason about execution order across producers. It never
//! interprets rule expressions; expression-level safety is the caller's
//! responsibility backed by the identifier validator and the applier's
//! check phase.

use std::fmt;

/// Table family a script targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    Inet,
    Ip,
    Ip6,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Inet => "inet",
            Family::Ip => "ip",
            Family::Ip6 => "ip6",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered sequence of nft commands for one table family. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Script {
    family: Family,
    lines: Vec<String>,
}

impl Script {
    pub fn family(&self) -> Family {
        self.family
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Render the script as `nft -f` input, one command per line.
    pub fn text(&self) -> String {
        let mut out = String::with_capacity(self.lines.iter().map(|l| l.len() + 1).sum());
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Chain declaration parameters for base chains.
#[derive(Clone, Debug)]
pub struct ChainSpec {
    pub chain_type: &'static str,
    pub hook: &'static str,
    pub priority: i32,
    pub policy: &'static str,
}

/// Flags accepted on set declarations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetFlag {
    Interval,
    Timeout,
    Constant,
}

impl SetFlag {
    fn as_str(&self) -> &'static str {
        match self {
            SetFlag::Interval => "interval",
            SetFlag::Timeout => "timeout",
            SetFlag::Constant => "constant",
        }
    }
}

/// Elements per `add element` command. Keeps each command comfortably below
/// the kernel's command-line limit.
pub const ELEMENT_BATCH: usize = 500;

pub struct ScriptBuilder {
    family: Family,
    table: String,
    lines: Vec<String>,
}

impl ScriptBuilder {
    pub fn new(family: Family, table: &str) -> Self {
        ScriptBuilder {
            family,
            table: table.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Declare the table, optionally carrying the generation-tag comment.
    pub fn table(&mut self, comment: Option<&str>) -> &mut Self {
        match comment {
            Some(c) => self.push(format!(
                "add table {} {} {{ comment {} }}",
                self.family,
                self.table,
                quoted(c)
            )),
            None => self.push(format!("add table {} {}", self.family, self.table)),
        }
        self
    }

    /// Declare a base chain and flush it. The flush is chain-granular so the
    /// table and its sets survive the apply.
    pub fn chain(&mut self, name: &str, spec: &ChainSpec) -> &mut Self {
        self.push(format!(
            "add chain {} {} {} {{ type {} hook {} priority {} ; policy {} ; }}",
            self.family, self.table, name, spec.chain_type, spec.hook, spec.priority, spec.policy
        ));
        self.push(format!("flush chain {} {} {}", self.family, self.table, name));
        self
    }

    /// Declare a regular (non-base) chain and flush it.
    pub fn named_chain(&mut self, name: &str) -> &mut Self {
        self.push(format!("add chain {} {} {}", self.family, self.table, name));
        self.push(format!("flush chain {} {} {}", self.family, self.table, name));
        self
    }

    pub fn rule(&mut self, chain: &str, expr: &str) -> &mut Self {
        self.push(format!("add rule {} {} {} {}", self.family, self.table, chain, expr));
        self
    }

    /// Append a rule with a comment, unless the expression already carries
    /// one (nft rejects a second `comment` in a single rule).
    pub fn rule_with_comment(&mut self, chain: &str, expr: &str, comment: &str) -> &mut Self {
        if expr.contains("comment ") {
            return self.rule(chain, expr);
        }
        let expr = format!("{} comment {}", expr, quoted(comment));
        self.rule(chain, &expr)
    }

    pub fn set(
        &mut self,
        name: &str,
        element_type: &str,
        flags: &[SetFlag],
        size: Option<usize>,
    ) -> &mut Self {
        let mut decl = format!(
            "add set {} {} {} {{ type {} ;",
            self.family, self.table, name, element_type
        );
        if !flags.is_empty() {
            let list: Vec<&str> = flags.iter().map(SetFlag::as_str).collect();
            decl.push_str(&format!(" flags {} ;", list.join(",")));
        }
        if let Some(size) = size {
            decl.push_str(&format!(" size {} ;", size));
        }
        decl.push_str(" }");
        self.push(decl);
        self
    }

    pub fn flush_set(&mut self, name: &str) -> &mut Self {
        self.push(format!("flush set {} {} {}", self.family, self.table, name));
        self
    }

    /// Verdict map declaration, e.g. `ifname : verdict`.
    pub fn map(&mut self, name: &str, key_type: &str, value_type: &str) -> &mut Self {
        self.push(format!(
            "add map {} {} {} {{ type {} : {} ; }}",
            self.family, self.table, name, key_type, value_type
        ));
        self
    }

    pub fn flush_map(&mut self, name: &str) -> &mut Self {
        self.push(format!("flush map {} {} {}", self.family, self.table, name));
        self
    }

    /// Add pre-rendered elements to a set or map in bounded batches.
    pub fn elements(&mut self, name: &str, elements: &[String]) -> &mut Self {
        for chunk in elements.chunks(ELEMENT_BATCH) {
            self.push(format!(
                "add element {} {} {} {{ {} }}",
                self.family,
                self.table,
                name,
                chunk.join(", ")
            ));
        }
        self
    }

    pub fn flowtable(&mut self, name: &str, priority: i32, devices: &[String]) -> &mut Self {
        let list: Vec<String> = devices.iter().map(|d| quoted(d)).collect();
        self.push(format!(
            "add flowtable {} {} {} {{ hook ingress priority {} ; devices = {{ {} }} ; }}",
            self.family,
            self.table,
            name,
            priority,
            list.join(", ")
        ));
        self
    }

    /// Escape hatch for commands the builder has no verb for.
    pub fn raw(&mut self, line: impl Into<String>) -> &mut Self {
        self.push(line.into());
        self
    }

    pub fn build(self) -> Script {
        Script {
            family: self.family,
            lines: self.lines,
        }
    }

    fn push(&mut self, line: String) {
        self.lines.push(line);
    }
}

/// True when the identifier can be emitted without quoting.
pub fn is_plain_ident(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

/// Emit an identifier, quoting anything outside `[A-Za-z0-9_.-]+`.
pub fn ident(s: &str) -> String {
    if is_plain_ident(s) {
        s.to_string()
    } else {
        quoted(s)
    }
}

/// Double-quoted form with escaped quotes and backslashes. Interface names
/// in concatenation sets must always go through this (nft requirement).
pub fn quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
