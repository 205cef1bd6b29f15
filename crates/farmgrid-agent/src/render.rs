//! Render command construction and renderer output parsing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use farm_core::FrameSpec;
use farm_core::config::RenderConfig;

/// A fully expanded renderer invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl RenderCommand {
    /// Expand the configured template for one task. `{file}`, `{start}`,
    /// `{end}` and `{threads}` are substituted in every argument; a
    /// configured niceness wraps the whole call in `nice -n`.
    pub fn build(config: &RenderConfig, file: &Path, frame: FrameSpec, threads: u32) -> Self {
        let file = file.display().to_string();
        let start = frame.first().to_string();
        let end = frame.last().to_string();
        let threads = threads.to_string();

        let expanded = config.args.iter().map(|arg| {
            arg.replace("{file}", &file)
                .replace("{start}", &start)
                .replace("{end}", &end)
                .replace("{threads}", &threads)
        });

        let (program, args) = match config.nice {
            Some(level) => {
                let mut args = vec![
                    "-n".to_string(),
                    level.to_string(),
                    config.program.display().to_string(),
                ];
                args.extend(expanded);
                (PathBuf::from("nice"), args)
            }
            None => (config.program.clone(), expanded.collect()),
        };

        Self {
            program,
            args,
            env: config.env.clone(),
        }
    }

    /// A tokio command for this invocation. Stdout is piped only when the
    /// caller wants to follow progress; stderr is discarded.
    pub fn command(&self, capture_stdout: bool) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(if capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// Frame number from a renderer status line such as
/// `Fra:42 Mem:310.5M (Peak 312.0M) | Time:00:01.23`.
pub fn parse_progress(line: &str) -> Option<i64> {
    line.split_whitespace()
        .next()?
        .strip_prefix("Fra:")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RenderConfig {
        RenderConfig {
            program: PathBuf::from("/opt/blender/blender"),
            nice: None,
            ..RenderConfig::default()
        }
    }

    #[test]
    fn template_is_expanded() {
        let cmd = RenderCommand::build(
            &config(),
            Path::new("/mnt/shows/a.blend"),
            FrameSpec::Single(17),
            4,
        );
        assert_eq!(cmd.program, PathBuf::from("/opt/blender/blender"));
        assert_eq!(
            cmd.args,
            vec!["-t", "4", "-y", "-b", "/mnt/shows/a.blend", "-s", "17", "-e", "17", "-a"]
        );
    }

    #[test]
    fn nice_wraps_the_renderer() {
        let mut config = config();
        config.nice = Some(10);
        config.args = vec!["-s".into(), "{start}".into(), "-e".into(), "{end}".into()];

        let cmd = RenderCommand::build(&config, Path::new("x.blend"), FrameSpec::Range(5, 9), 1);
        assert_eq!(cmd.program, PathBuf::from("nice"));
        assert_eq!(
            cmd.args,
            vec!["-n", "10", "/opt/blender/blender", "-s", "5", "-e", "9"]
        );
    }

    #[test]
    fn progress_lines() {
        assert_eq!(parse_progress("Fra:42 Mem:310.5M (Peak 312.0M)"), Some(42));
        assert_eq!(parse_progress("  Fra:7"), Some(7));
        assert_eq!(parse_progress("Saved: '/tmp/0001.png'"), None);
        assert_eq!(parse_progress("Fra:abc Mem:1M"), None);
        assert_eq!(parse_progress(""), None);
    }
}
