//! Command-line construction for compile, link and generator steps.
//!
//! Templates from `quark.toml` are expanded here, and compile commands are
//! wrapped into the local or remote-shell process that the scheduler spawns.

use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result};

use crate::hosts::{Host, HostSlot};

/// Prefix of the line every wrapped compile command prints last.
///
/// Some remote shells drop the exit status of the remote command, so the
/// wrapper echoes it explicitly and the scheduler reads it back.
pub const STATUS_MARKER: &str = "quark-exit-status=";

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=+,:@%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Quote a path for a POSIX shell.
pub fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Replace `{key}` placeholders in `template` in a single pass.
///
/// Substituted values are never rescanned, and braces that do not name a
/// known key are copied through unchanged.
pub fn expand(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after.find('}').and_then(|close| {
            let key = &after[..close];
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (*value, close))
        });
        match value {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Builder for one compile command line.
pub struct CompileCommandBuilder<'a> {
    template: &'a str,
    compiler: &'a str,
    flags: Vec<String>,
    input: Option<&'a Path>,
    output: Option<&'a Path>,
}

impl<'a> CompileCommandBuilder<'a> {
    pub fn new(template: &'a str, compiler: &'a str) -> Self {
        Self {
            template,
            compiler,
            flags: Vec::new(),
            input: None,
            output: None,
        }
    }

    /// Replace the compiler (per-file override).
    pub fn compiler(&mut self, compiler: &'a str) -> &mut Self {
        self.compiler = compiler;
        self
    }

    pub fn flags<I, S>(&mut self, flags: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags.extend(flags.into_iter().map(Into::into));
        self
    }

    pub fn input(&mut self, path: &'a Path) -> &mut Self {
        self.input = Some(path);
        self
    }

    pub fn output(&mut self, path: &'a Path) -> &mut Self {
        self.output = Some(path);
        self
    }

    /// Expand the template into a shell command line.
    pub fn build(&self) -> String {
        let flags = self
            .flags
            .iter()
            .map(|f| shell_quote(f))
            .collect::<Vec<_>>()
            .join(" ");
        let input = self.input.map(quote_path).unwrap_or_default();
        let output = self.output.map(quote_path).unwrap_or_default();
        collapse_spaces(&expand(
            self.template,
            &[
                ("compiler", self.compiler),
                ("flags", &flags),
                ("input", &input),
                ("output", &output),
            ],
        ))
    }
}

/// Expand a link template.
pub fn link_command(
    template: &str,
    linker: &str,
    objects: &[&Path],
    flags: &[String],
    output: &Path,
) -> String {
    let objects = objects.iter().map(|p| quote_path(p)).collect::<Vec<_>>().join(" ");
    let flags = flags.iter().map(|f| shell_quote(f)).collect::<Vec<_>>().join(" ");
    collapse_spaces(&expand(
        template,
        &[
            ("linker", linker),
            ("objects", &objects),
            ("flags", &flags),
            ("output", &quote_path(output)),
        ],
    ))
}

/// Empty placeholders leave runs of spaces behind. Spaces inside single
/// quotes are kept as they are.
fn collapse_spaces(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut quoted = false;
    for ch in s.chars() {
        if ch == '\'' {
            quoted = !quoted;
        }
        if ch == ' ' && !quoted && (out.is_empty() || out.ends_with(' ')) {
            continue;
        }
        out.push(ch);
    }
    out.trim_end().to_string()
}

/// The shell script a compile job runs: change directory, compile, echo status.
pub fn job_script(dir: &Path, command_line: &str) -> String {
    format!("cd {}; {command_line}; echo {STATUS_MARKER}$?", quote_path(dir))
}

/// Build the process that runs `script` on `slot`.
///
/// `[nice -n N] sh -c '<script>'` locally, or
/// `[nice -n N] <shell> <flags...> <host> '<script>'` remotely.
pub fn host_command(slot: &HostSlot, shell: &str, shell_flags: &[String], script: &str) -> Command {
    let mut argv: Vec<OsString> = Vec::new();
    if let Some(n) = slot.niceness {
        argv.extend(["nice".into(), "-n".into(), n.to_string().into()]);
    }
    match &slot.host {
        Host::Local => argv.extend(["sh".into(), "-c".into()]),
        Host::Remote(name) => {
            argv.push(shell.into());
            argv.extend(shell_flags.iter().map(OsString::from));
            argv.push(name.into());
        }
    }
    argv.push(script.into());

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd
}

/// Parse a trailing status line.
pub fn parse_status_line(line: &str) -> Option<i32> {
    line.trim().strip_prefix(STATUS_MARKER)?.trim().parse().ok()
}

/// Run a shell command line locally in `dir` and capture its output.
pub fn run_shell(command_line: &str, dir: &Path) -> Result<Output> {
    Command::new("sh")
        .arg("-c")
        .arg(command_line)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to run `{command_line}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("-O2"), "-O2");
        assert_eq!(shell_quote("/a/b.cc"), "/a/b.cc");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn compile_template_expansion() {
        let input = Path::new("/src/a b.cc");
        let output = Path::new("/build/obj/a.o");
        let mut builder = CompileCommandBuilder::new("{compiler} {flags} -c {input} -o {output}", "c++");
        builder.flags(["-O2", "-DNAME=x y"]).input(input).output(output);
        assert_eq!(
            builder.build(),
            "c++ -O2 '-DNAME=x y' -c '/src/a b.cc' -o /build/obj/a.o"
        );
    }

    #[test]
    fn empty_flags_leave_no_gap() {
        let mut builder = CompileCommandBuilder::new("{compiler} {flags} -c {input} -o {output}", "cc");
        builder.input(Path::new("a.c")).output(Path::new("a.o"));
        assert_eq!(builder.build(), "cc -c a.c -o a.o");
    }

    #[test]
    fn substituted_values_are_not_expanded_again() {
        let expanded = expand(
            "{compiler} {flags} -o {output} ${HOME} {unknown}",
            &[("compiler", "cc"), ("flags", "-DFMT={output}"), ("output", "a.o")],
        );
        assert_eq!(expanded, "cc -DFMT={output} -o a.o ${HOME} {unknown}");
    }

    #[test]
    fn link_template_expansion() {
        let cmd = link_command(
            "{linker} {objects} {flags} -o {output}",
            "c++",
            &[Path::new("/o/main.o"), Path::new("/o/util.o")],
            &["-lz".into()],
            Path::new("/bin/app"),
        );
        assert_eq!(cmd, "c++ /o/main.o /o/util.o -lz -o /bin/app");
    }

    #[test]
    fn script_echoes_status() {
        let script = job_script(Path::new("/src"), "cc -c a.c");
        assert_eq!(script, format!("cd /src; cc -c a.c; echo {STATUS_MARKER}$?"));
    }

    #[test]
    fn remote_command_shape() {
        let slot = HostSlot {
            host: Host::Remote("box1".into()),
            niceness: Some(10),
        };
        let cmd = host_command(&slot, "ssh", &["-x".into()], "true");
        assert_eq!(cmd.get_program(), "nice");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["-n", "10", "ssh", "-x", "box1", "true"]);
    }

    #[test]
    fn local_command_shape() {
        let slot = HostSlot {
            host: Host::Local,
            niceness: None,
        };
        let cmd = host_command(&slot, "ssh", &[], "true");
        assert_eq!(cmd.get_program(), "sh");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["-c", "true"]);
    }

    #[test]
    fn status_line_parsing() {
        assert_eq!(parse_status_line("quark-exit-status=0"), Some(0));
        assert_eq!(parse_status_line("quark-exit-status=127\n"), Some(127));
        assert_eq!(parse_status_line("error: foo"), None);
    }
}
