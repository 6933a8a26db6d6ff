//! Syscall ABI tables.

mod frame;
mod i386;
pub mod socket;

use std::{collections::BTreeMap, path::Path};

use indexmap::IndexMap;
use regex::Regex;

pub use self::frame::{SyscallEntry, SyscallFrame};
use crate::LinuxError;

/// Name reported for numbers that are not in the table.
pub const NOT_MAPPED: &str = "not_mapped";

/// Mapping between syscall numbers and names.
#[derive(Debug, Clone, Default)]
pub struct SyscallTable {
    by_number: BTreeMap<u64, String>,
    by_name: IndexMap<String, u64>,
}

impl SyscallTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the built-in Linux i386 table.
    pub fn linux_i386() -> Self {
        let mut table = Self::new();
        for (number, name) in i386::LINUX_I386 {
            table.insert(*number, *name);
        }
        table
    }

    /// Parses a kernel `unistd_32.h` style header.
    ///
    /// Recognizes `#define __NR_name N` and `#define __NR_name (SYMBOL+N)`,
    /// where `SYMBOL` is a previously defined `__NR_` constant (such as
    /// `__NR_SYSCALL_BASE`). The `ia32_` prefix is dropped from names.
    pub fn from_unistd(text: &str) -> Self {
        const DEFINE: &str = r"^\s*#\s*define\s+(__NR_\w+)\s+(.+?)\s*$";
        const OFFSET: &str = r"^\(?\s*(\w+)\s*\+\s*(\w+)\s*\)?$";

        // Both patterns are constant.
        let (Ok(define), Ok(offset)) = (Regex::new(DEFINE), Regex::new(OFFSET))
        else {
            return Self::new();
        };

        let mut symbols = IndexMap::<String, u64>::new();
        let mut table = Self::new();

        for line in text.lines() {
            let Some(captures) = define.captures(line)
            else {
                continue;
            };

            let symbol = &captures[1];
            let expression = &captures[2];

            let value = match parse_number(expression) {
                Some(value) => value,
                None => match offset.captures(expression) {
                    Some(parts) => {
                        let base = symbols
                            .get(&parts[1])
                            .copied()
                            .or_else(|| parse_number(&parts[1]));
                        let addend = parse_number(&parts[2]);

                        match (base, addend) {
                            (Some(base), Some(addend)) => base + addend,
                            _ => {
                                tracing::debug!(symbol, expression, "unresolved syscall define");
                                continue;
                            }
                        }
                    }
                    None => {
                        tracing::debug!(symbol, expression, "unparsed syscall define");
                        continue;
                    }
                },
            };

            symbols.insert(symbol.to_owned(), value);

            let name = &symbol["__NR_".len()..];
            if matches!(name, "syscall_max" | "syscalls" | "SYSCALL_BASE") {
                continue;
            }

            let name = name.strip_prefix("ia32_").unwrap_or(name);
            table.insert(value, name);
        }

        table
    }

    /// Parses a kernel `syscall_*.tbl` style table.
    ///
    /// Each line holds the number and the name, separated by whitespace.
    /// When the second column is an ABI (`i386`, `common`, `64`, `x32`,
    /// `oabi`, `eabi`), the name is taken from the third column. Blank
    /// lines and `#` comments are skipped.
    pub fn from_tbl(text: &str) -> Result<Self, LinuxError> {
        let mut table = Self::new();

        for line in text.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            let mut columns = line.split_whitespace();
            let (Some(number), Some(second)) = (columns.next(), columns.next())
            else {
                return Err(LinuxError::InvalidSyscallTable(line.to_owned()));
            };

            let Some(number) = parse_number(number)
            else {
                return Err(LinuxError::InvalidSyscallTable(line.to_owned()));
            };

            let name = match second {
                "i386" | "common" | "64" | "x32" | "oabi" | "eabi" => match columns.next() {
                    Some(name) => name,
                    None => return Err(LinuxError::InvalidSyscallTable(line.to_owned())),
                },
                name => name,
            };

            table.insert(number, name);
        }

        Ok(table)
    }

    /// Loads a table from a file.
    ///
    /// Files with the `.tbl` extension are parsed as syscall tables, all
    /// others as `unistd` headers.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LinuxError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;

        let table = match path.extension().and_then(|extension| extension.to_str()) {
            Some("tbl") => Self::from_tbl(&text)?,
            _ => Self::from_unistd(&text),
        };

        tracing::debug!(path = %path.display(), syscalls = table.len(), "syscall table loaded");
        Ok(table)
    }

    /// Adds a syscall.
    ///
    /// A later definition of the same number replaces the name.
    pub fn insert(&mut self, number: u64, name: impl Into<String>) {
        let name = name.into();

        if let Some(previous) = self.by_number.insert(number, name.clone()) {
            if self.by_name.get(&previous) == Some(&number) {
                self.by_name.shift_remove(&previous);
            }
        }

        self.by_name.insert(name, number);
    }

    /// Returns the name of a syscall, or [`NOT_MAPPED`].
    pub fn name(&self, number: u64) -> &str {
        self.by_number
            .get(&number)
            .map(String::as_str)
            .unwrap_or(NOT_MAPPED)
    }

    /// Returns the number of a syscall.
    pub fn number(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    /// Returns the number of a syscall, failing if it is unknown.
    pub fn require(&self, name: &str) -> Result<u64, LinuxError> {
        self.number(name)
            .ok_or_else(|| LinuxError::UnknownSyscall(name.to_owned()))
    }

    /// Returns the number of syscalls in the table.
    pub fn len(&self) -> usize {
        self.by_number.len()
    }

    /// Checks whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.by_number.is_empty()
    }

    /// Iterates over the syscalls in ascending number order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> {
        self.by_number
            .iter()
            .map(|(number, name)| (*number, name.as_str()))
    }
}

fn parse_number(text: &str) -> Option<u64> {
    let text = text.trim();

    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_i386() {
        let table = SyscallTable::linux_i386();

        assert_eq!(table.name(5), "open");
        assert_eq!(table.name(102), "socketcall");
        assert_eq!(table.name(252), "exit_group");
        assert_eq!(table.number("pipe2"), Some(331));
        assert_eq!(table.number("_llseek"), Some(140));

        // Unused slots.
        assert_eq!(table.name(222), NOT_MAPPED);
        assert_eq!(table.name(100_000), NOT_MAPPED);
        assert_eq!(table.number("no_such_call"), None);
    }

    #[test]
    fn unistd_header() {
        let text = "\
#ifndef _ASM_X86_UNISTD_32_H
#define _ASM_X86_UNISTD_32_H 1

#define __NR_restart_syscall 0
#define __NR_exit 1
#define __NR_ia32_fork 2
#define __NR_syscall_max 2
";
        let table = SyscallTable::from_unistd(text);

        assert_eq!(table.len(), 3);
        assert_eq!(table.name(0), "restart_syscall");
        assert_eq!(table.number("fork"), Some(2));
        assert_eq!(table.number("syscall_max"), None);
    }

    #[test]
    fn unistd_relative_defines() {
        let text = "\
#define __NR_SYSCALL_BASE 0x900000
#define __NR_restart_syscall (__NR_SYSCALL_BASE+  0)
#define __NR_exit (__NR_SYSCALL_BASE+  1)
#define __NR_read (__NR_SYSCALL_BASE+3)
";
        let table = SyscallTable::from_unistd(text);

        assert_eq!(table.len(), 3);
        assert_eq!(table.name(0x900001), "exit");
        assert_eq!(table.number("read"), Some(0x900003));
        assert_eq!(table.number("SYSCALL_BASE"), None);
    }

    #[test]
    fn tbl_formats() -> Result<(), LinuxError> {
        let text = "\
# 32-bit system call numbers and entry vectors
0\ti386\trestart_syscall\tsys_restart_syscall
1\ti386\texit\t\t\tsys_exit
3 read
";
        let table = SyscallTable::from_tbl(text)?;

        assert_eq!(table.name(0), "restart_syscall");
        assert_eq!(table.name(1), "exit");
        assert_eq!(table.name(3), "read");
        assert_eq!(table.name(2), NOT_MAPPED);

        assert!(matches!(
            SyscallTable::from_tbl("x open"),
            Err(LinuxError::InvalidSyscallTable(_))
        ));

        Ok(())
    }

    #[test]
    fn load_by_extension() -> Result<(), LinuxError> {
        let dir = tempfile::tempdir()?;

        let tbl = dir.path().join("syscall_32.tbl");
        std::fs::write(&tbl, "5 i386 open sys_open\n")?;
        assert_eq!(SyscallTable::load(&tbl)?.number("open"), Some(5));

        let header = dir.path().join("unistd_32.h");
        std::fs::write(&header, "#define __NR_open 5\n")?;
        assert_eq!(SyscallTable::load(&header)?.name(5), "open");

        Ok(())
    }

    #[test]
    fn renumbered_name() {
        let mut table = SyscallTable::new();
        table.insert(1, "old");
        table.insert(1, "new");

        assert_eq!(table.name(1), "new");
        assert_eq!(table.number("old"), None);
        assert_eq!(table.require("new").ok(), Some(1));
        assert!(table.require("old").is_err());
    }
}
