use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use snapback_core::write_file_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GrubConfig {
    header: Vec<String>,
    entries: Vec<GrubEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrubEntry {
    pub title: String,
    pub lines: Vec<EntryLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryLine {
    Root(String),
    Kernel { path: String, args: Vec<String> },
    Initrd(String),
    Other(String),
}

impl GrubConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read bootloader config: {}", path.display()))?;
        Ok(Self::parse(&raw))
    }

    pub fn parse(raw: &str) -> Self {
        let mut config = Self::default();
        for line in raw.lines() {
            let trimmed = line.trim();
            let (keyword, rest) = split_keyword(trimmed);

            if keyword == "title" {
                config.entries.push(GrubEntry {
                    title: rest.to_string(),
                    lines: Vec::new(),
                });
                continue;
            }

            let Some(entry) = config.entries.last_mut() else {
                config.header.push(line.to_string());
                continue;
            };
            if trimmed.is_empty() {
                continue;
            }
            let parsed = match keyword {
                "root" => EntryLine::Root(rest.to_string()),
                "kernel" => {
                    let mut parts = rest.split_whitespace();
                    let path = parts.next().unwrap_or_default().to_string();
                    EntryLine::Kernel {
                        path,
                        args: parts.map(str::to_string).collect(),
                    }
                }
                "initrd" => EntryLine::Initrd(rest.to_string()),
                _ => EntryLine::Other(trimmed.to_string()),
            };
            entry.lines.push(parsed);
        }
        config
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.header {
            out.push_str(line);
            out.push('\n');
        }
        for entry in &self.entries {
            out.push_str(&format!("title {}\n", entry.title));
            for line in &entry.lines {
                out.push('\t');
                out.push_str(&line.render());
                out.push('\n');
            }
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_file_atomic(path, self.render().as_bytes())
            .with_context(|| format!("failed to write bootloader config: {}", path.display()))
    }

    pub fn entries(&self) -> &[GrubEntry] {
        &self.entries
    }

    /// Index selected by `default=N`; grub falls back to the first entry.
    pub fn default_index(&self) -> usize {
        self.header
            .iter()
            .map(|line| line.trim())
            .filter(|line| !line.starts_with('#'))
            .find_map(|line| {
                let value = line
                    .strip_prefix("default")?
                    .trim_start_matches(|ch: char| ch == '=' || ch.is_whitespace());
                value.parse::<usize>().ok()
            })
            .unwrap_or(0)
    }

    pub fn default_entry(&self) -> Option<&GrubEntry> {
        self.entries.get(self.default_index())
    }

    pub fn find_by_kernel(&self, kernel_file_name: &str) -> Option<&GrubEntry> {
        self.entries
            .iter()
            .find(|entry| entry.boots(kernel_file_name))
    }

    pub fn push_entry(&mut self, entry: GrubEntry) {
        self.entries.push(entry);
    }

    /// Drops every entry booting `kernel_file_name`, the way `grubby
    /// --remove-kernel` does. Returns how many were dropped.
    pub fn remove_kernel_entries(&mut self, kernel_file_name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| !entry.boots(kernel_file_name));
        before - self.entries.len()
    }
}

impl GrubEntry {
    pub fn kernel_path(&self) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            EntryLine::Kernel { path, .. } => Some(path.as_str()),
            _ => None,
        })
    }

    pub fn kernel_args(&self) -> &[String] {
        self.lines
            .iter()
            .find_map(|line| match line {
                EntryLine::Kernel { args, .. } => Some(args.as_slice()),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn initrd_path(&self) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            EntryLine::Initrd(path) => Some(path.as_str()),
            _ => None,
        })
    }

    pub fn boots(&self, kernel_file_name: &str) -> bool {
        self.kernel_path()
            .map(|path| path.rsplit('/').next() == Some(kernel_file_name))
            .unwrap_or(false)
    }

    pub fn with_version_replaced(&self, from: &str, to: &str) -> Self {
        let lines = self
            .lines
            .iter()
            .map(|line| match line {
                EntryLine::Kernel { path, args } => EntryLine::Kernel {
                    path: path.replace(from, to),
                    args: args.iter().map(|arg| arg.replace(from, to)).collect(),
                },
                EntryLine::Initrd(path) => EntryLine::Initrd(path.replace(from, to)),
                other => other.clone(),
            })
            .collect();
        Self {
            title: self.title.clone(),
            lines,
        }
    }

    pub fn push_kernel_arg(&mut self, arg: &str) {
        for line in &mut self.lines {
            if let EntryLine::Kernel { args, .. } = line {
                if !args.iter().any(|existing| existing == arg) {
                    args.push(arg.to_string());
                }
            }
        }
    }
}

impl EntryLine {
    fn render(&self) -> String {
        match self {
            Self::Root(value) => format!("root {value}"),
            Self::Kernel { path, args } if args.is_empty() => format!("kernel {path}"),
            Self::Kernel { path, args } => format!("kernel {path} {}", args.join(" ")),
            Self::Initrd(path) => format!("initrd {path}"),
            Self::Other(raw) => raw.clone(),
        }
    }
}

fn split_keyword(line: &str) -> (&str, &str) {
    match line.find(|ch: char| ch.is_whitespace() || ch == '=') {
        Some(at) => (
            &line[..at],
            line[at..].trim_start_matches(|ch: char| ch == '=' || ch.is_whitespace()),
        ),
        None => (line, ""),
    }
}
