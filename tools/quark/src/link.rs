//! Final link step.
//!
//! Runs one link command per link-eligible executable. Objects compiled on
//! a remote host may show up on the shared filesystem late, so each object is
//! polled until its mtime catches up with its sources before linking.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};

use crate::command;
use crate::config::BuildConfig;
use crate::registry::Registry;
use crate::unit::UnitId;
use crate::verbose::vprintln;

pub struct Linker<'r, 'a> {
    registry: &'r mut Registry<'a>,
    shared: bool,
}

impl<'r, 'a> Linker<'r, 'a> {
    pub fn new(registry: &'r mut Registry<'a>, shared: bool) -> Self {
        Self { registry, shared }
    }

    /// Link `executable` from `link_set` (in link order).
    ///
    /// On success the new artifact replaces the old one in a single rename;
    /// on failure any previous artifact is left untouched.
    pub fn link(&mut self, executable: UnitId, link_set: &[UnitId]) -> Result<PathBuf> {
        let config = self.registry.config();
        let unit = self.registry.unit(executable);
        let output = unit
            .link_output_path(&config.build_dir, self.shared)
            .with_context(|| format!("{} has no link output", unit.path.display()))?;

        self.await_objects(link_set)?;

        let objects: Vec<PathBuf> = link_set
            .iter()
            .map(|&id| self.registry.unit(id).object_path.clone())
            .collect();
        let object_refs: Vec<&Path> = objects.iter().map(PathBuf::as_path).collect();
        let flags = self.link_flags(link_set);

        let parent = output.parent().unwrap_or(&config.build_dir);
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        let tmp = temporary_sibling(&output);
        let command_line = command::link_command(
            &config.link.command,
            &config.link.linker,
            &object_refs,
            &flags,
            &tmp,
        );

        vprintln!("  linking {}", output.display());
        vprintln!("  {command_line}");
        let result = command::run_shell(&command_line, &config.root)?;
        if !result.status.success() || !tmp.exists() {
            let _ = std::fs::remove_file(&tmp);
            let stderr = String::from_utf8_lossy(&result.stderr);
            bail!(
                "link of {} failed ({}):\n{}",
                output.display(),
                result.status,
                stderr.trim_end()
            );
        }
        std::fs::rename(&tmp, &output)
            .with_context(|| format!("failed to replace {}", output.display()))?;
        self.registry.invalidate(&output);
        publish_output(config, &output)?;
        Ok(output)
    }

    /// Wait until every object is at least as new as its sources.
    fn await_objects(&mut self, link_set: &[UnitId]) -> Result<()> {
        let config = self.registry.config();
        for &id in link_set {
            let wanted = self.registry.transitive_last_modified(id);
            let object = self.registry.unit(id).object_path.clone();
            let deadline = Instant::now() + config.link.settle_timeout;
            loop {
                self.registry.invalidate(&object);
                match self.registry.modified(&object) {
                    Some(mtime) if mtime >= wanted => break,
                    _ if Instant::now() >= deadline => bail!(
                        "object {} did not become current within {:?}",
                        object.display(),
                        config.link.settle_timeout
                    ),
                    _ => std::thread::sleep(config.link.settle_poll),
                }
            }
        }
        Ok(())
    }

    /// Configured flags, then the link flags of every library triggered
    /// anywhere in the link set, in registry order.
    fn link_flags(&mut self, link_set: &[UnitId]) -> Vec<String> {
        let config = self.registry.config();
        let mut flags = config.link.flags.clone();
        if self.shared {
            flags.extend(config.link.shared_flags.iter().cloned());
        }
        let mut libraries = BTreeSet::new();
        for &id in link_set {
            libraries.extend(self.registry.transitive_libraries(id));
        }
        for idx in libraries {
            flags.extend(config.libraries[idx].link_flags.iter().cloned());
        }
        flags
    }
}

fn temporary_sibling(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    output.with_file_name(name)
}

/// Point `<publish-dir>/<name>` at a freshly linked or up-to-date output.
pub fn publish_output(config: &BuildConfig, output: &Path) -> Result<()> {
    let Some(dir) = &config.link.publish_dir else {
        return Ok(());
    };
    let Some(name) = output.file_name() else {
        return Ok(());
    };
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let link = dir.join(name);
    if link.symlink_metadata().is_ok() {
        std::fs::remove_file(&link)
            .with_context(|| format!("failed to remove stale {}", link.display()))?;
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(output, &link)
        .with_context(|| format!("failed to link {}", link.display()))?;
    #[cfg(not(unix))]
    std::fs::copy(output, &link).with_context(|| format!("failed to copy {}", link.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, SystemTime};

    fn project(config_toml: &str) -> (tempfile::TempDir, BuildConfig) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("quark.toml"), config_toml).unwrap();
        fs::write(dir.path().join("main.cc"), "#include \"util.h\"\nint main() {}\n").unwrap();
        fs::write(dir.path().join("util.h"), "#include <zlib.h>\n").unwrap();
        fs::write(dir.path().join("util.cc"), "#include \"util.h\"\n").unwrap();
        let config = BuildConfig::load(dir.path()).unwrap();
        (dir, config)
    }

    /// Stand in for the compiler: write each object after its source.
    fn fake_compile(registry: &Registry<'_>, ids: &[UnitId], text: &str) {
        for &id in ids {
            let obj = &registry.unit(id).object_path;
            fs::create_dir_all(obj.parent().unwrap()).unwrap();
            fs::write(obj, text).unwrap();
        }
    }

    const CAT_LINKER: &str = r#"
        [link]
        command = "cat {objects} > {output} && echo {flags} >> {output}"
        flags = ["-O2"]
        settle-timeout-ms = 200
        settle-poll-ms = 10

        [[library]]
        name = "z"
        triggers = ["zlib.h"]
        link-flags = ["-lz"]
    "#;

    #[test]
    fn links_objects_in_order_with_library_flags() {
        let (dir, config) = project(CAT_LINKER);
        let mut registry = Registry::new(&config);
        let main = registry.get(&dir.path().join("main.cc")).unwrap();
        let util = registry.get(&dir.path().join("util.cc")).unwrap();
        fake_compile(&registry, &[main], "M\n");
        fake_compile(&registry, &[util], "U\n");

        let output = Linker::new(&mut registry, false).link(main, &[main, util]).unwrap();
        assert_eq!(output, config.build_dir.join("bin/main"));
        assert_eq!(fs::read_to_string(&output).unwrap(), "M\nU\n-O2 -lz\n");
        assert!(!config.build_dir.join("bin/main.tmp").exists());
    }

    #[test]
    fn failed_link_keeps_previous_artifact() {
        let (dir, config) = project("[link]\ncommand = \"false {objects} {output}\"\nsettle-timeout-ms = 100\n");
        let mut registry = Registry::new(&config);
        let main = registry.get(&dir.path().join("main.cc")).unwrap();
        fake_compile(&registry, &[main], "M\n");

        let output = config.build_dir.join("bin/main");
        fs::create_dir_all(output.parent().unwrap()).unwrap();
        fs::write(&output, "old").unwrap();

        let err = Linker::new(&mut registry, false).link(main, &[main]).unwrap_err();
        assert!(err.to_string().contains("link of"), "unexpected error: {err}");
        assert_eq!(fs::read_to_string(&output).unwrap(), "old");
    }

    #[test]
    fn missing_object_times_out() {
        let (dir, config) = project(CAT_LINKER);
        let mut registry = Registry::new(&config);
        let main = registry.get(&dir.path().join("main.cc")).unwrap();

        let err = Linker::new(&mut registry, false).link(main, &[main]).unwrap_err();
        assert!(err.to_string().contains("did not become current"), "unexpected error: {err}");
    }

    #[test]
    fn waits_for_object_to_become_current() {
        let (dir, config) = project(
            "[link]\ncommand = \"cat {objects} > {output}\"\nsettle-timeout-ms = 5000\nsettle-poll-ms = 10\n",
        );
        let mut registry = Registry::new(&config);
        let main = registry.get(&dir.path().join("main.cc")).unwrap();
        let object = registry.unit(main).object_path.clone();

        // An object left over from before the sources changed.
        fake_compile(&registry, &[main], "old\n");
        fs::File::options()
            .write(true)
            .open(&object)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        let writer = {
            let object = object.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                fs::write(&object, "new\n").unwrap();
            })
        };
        let output = Linker::new(&mut registry, false).link(main, &[main]).unwrap();
        writer.join().unwrap();
        assert_eq!(fs::read_to_string(&output).unwrap(), "new\n");
    }

    #[cfg(unix)]
    #[test]
    fn publishes_symlink() {
        let (dir, config) = project(CAT_LINKER);
        let mut config = config;
        config.link.publish_dir = Some(config.root.join("out"));
        let mut registry = Registry::new(&config);
        let main = registry.get(&dir.path().join("main.cc")).unwrap();
        fake_compile(&registry, &[main], "M\n");

        let output = Linker::new(&mut registry, false).link(main, &[main]).unwrap();
        let published = config.root.join("out/main");
        assert_eq!(fs::read_link(&published).unwrap(), output);

        // Refreshing an existing link replaces it.
        publish_output(&config, &output).unwrap();
        assert_eq!(fs::read_link(&published).unwrap(), output);
    }
}
