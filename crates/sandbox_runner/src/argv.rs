use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::RunnerSettings;

const DEFAULT_SHELL: &str = "/bin/sh";

/// Builds the `bwrap` argv for one invocation, following the shape of the
/// teacher's `create_bwrap_flags`/`create_filesystem_args`: session flags
/// first, then filesystem binds, then namespace flags, then `--` and the
/// wrapped command.
pub fn build_bwrap_args(settings: &RunnerSettings, command: &str) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    let push = |args: &mut Vec<OsString>, s: &str| args.push(OsString::from(s));
    let push_path = |args: &mut Vec<OsString>, p: &Path| args.push(p.as_os_str().to_owned());

    push(&mut args, "--die-with-parent");
    push(&mut args, "--new-session");

    push(&mut args, "--ro-bind");
    push_path(&mut args, &settings.rootfs);
    push(&mut args, "/");

    push(&mut args, "--bind");
    push_path(&mut args, &settings.session_dir);
    push(&mut args, "/home/sandbox");

    push(&mut args, "--bind");
    push_path(&mut args, &settings.tmp_dir);
    push(&mut args, "/tmp");

    if let Some(resolv_conf) = &settings.resolv_conf {
        push(&mut args, "--ro-bind");
        push_path(&mut args, resolv_conf);
        push(&mut args, "/etc/resolv.conf");
    }

    push(&mut args, "--proc");
    push(&mut args, "/proc");
    push(&mut args, "--dev");
    push(&mut args, "/dev");

    push(&mut args, "--unshare-uts");
    push(&mut args, "--hostname");
    push(&mut args, "sandbox");
    push(&mut args, "--unshare-pid");
    push(&mut args, "--unshare-user");

    if settings.join_netns_pid.is_none() {
        push(&mut args, "--unshare-net");
    }
    // When `join_netns_pid` is set, network namespace entry happens via an
    // `nsenter --net=...` wrapper around this whole invocation (see
    // `build_invocation`); bwrap itself keeps the (already-entered)
    // namespace it was started in.

    push(&mut args, "--chdir");
    push(&mut args, "/home/sandbox");

    for (key, value) in sandbox_environment(settings) {
        push(&mut args, "--setenv");
        args.push(OsString::from(key));
        args.push(OsString::from(value));
    }

    push(&mut args, "--");

    let shell = settings.shell.as_deref().unwrap_or(DEFAULT_SHELL);
    push(&mut args, shell);
    push(&mut args, "-c");
    args.push(OsString::from(command));

    args
}

/// The curated environment: a caller-provided base set with `HOME`, `USER`,
/// `PWD` forced to sandbox-appropriate values. Anything not in the base set
/// or this override list is dropped (`spec.md §4.5`).
pub fn sandbox_environment(settings: &RunnerSettings) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = settings
        .env_override
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for (key, value) in [
        ("HOME", "/home/sandbox"),
        ("USER", "sandbox"),
        ("PWD", "/home/sandbox"),
    ] {
        env.retain(|(k, _)| k != key);
        env.push((key.to_string(), value.to_string()));
    }
    env
}

/// Wraps the `bwrap` argv with an `nsenter` prefix when joining a specific
/// existing network namespace instead of creating a new one.
pub fn build_invocation(settings: &RunnerSettings, command: &str) -> (PathBuf, Vec<OsString>) {
    let bwrap_args = build_bwrap_args(settings, command);
    match settings.join_netns_pid {
        Some(pid) => {
            let mut args = vec![
                OsString::from(format!("--net=/proc/{pid}/ns/net")),
                OsString::from("--"),
                settings.bwrap_path.as_os_str().to_owned(),
            ];
            args.extend(bwrap_args);
            (PathBuf::from("nsenter"), args)
        }
        None => (settings.bwrap_path.clone(), bwrap_args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IoMode, RunnerSettings};

    fn base_settings() -> RunnerSettings {
        RunnerSettings {
            bwrap_path: PathBuf::from("/usr/bin/bwrap"),
            shell: None,
            rootfs: PathBuf::from("/rootfs"),
            session_dir: PathBuf::from("/session"),
            tmp_dir: PathBuf::from("/tmp-backing"),
            resolv_conf: None,
            env_override: vec![("LANG".to_string(), "C".to_string())],
            join_netns_pid: None,
            io_mode: IoMode::Pipe,
        }
    }

    #[test]
    fn binds_rootfs_session_and_tmp() {
        let args = build_bwrap_args(&base_settings(), "echo hi");
        let joined: Vec<String> = args.iter().map(|s| s.to_string_lossy().into_owned()).collect();
        assert!(joined.windows(3).any(|w| w == ["--ro-bind", "/rootfs", "/"]));
        assert!(joined.windows(3).any(|w| w == ["--bind", "/session", "/home/sandbox"]));
        assert!(joined.windows(3).any(|w| w == ["--bind", "/tmp-backing", "/tmp"]));
    }

    #[test]
    fn omits_resolv_conf_bind_when_not_configured() {
        let args = build_bwrap_args(&base_settings(), "true");
        let joined: Vec<String> = args.iter().map(|s| s.to_string_lossy().into_owned()).collect();
        assert!(!joined.iter().any(|a| a == "/etc/resolv.conf"));
    }

    #[test]
    fn includes_resolv_conf_bind_when_configured() {
        let mut settings = base_settings();
        settings.resolv_conf = Some(PathBuf::from("/host/resolv.conf"));
        let args = build_bwrap_args(&settings, "true");
        let joined: Vec<String> = args.iter().map(|s| s.to_string_lossy().into_owned()).collect();
        assert!(joined.windows(3).any(|w| w == ["--ro-bind", "/host/resolv.conf", "/etc/resolv.conf"]));
    }

    #[test]
    fn unshares_net_by_default() {
        let args = build_bwrap_args(&base_settings(), "true");
        assert!(args.iter().any(|a| a == "--unshare-net"));
    }

    #[test]
    fn join_netns_pid_skips_unshare_net_and_wraps_with_nsenter() {
        let mut settings = base_settings();
        settings.join_netns_pid = Some(4242);
        let args = build_bwrap_args(&settings, "true");
        assert!(!args.iter().any(|a| a == "--unshare-net"));

        let (program, wrapped_args) = build_invocation(&settings, "true");
        assert_eq!(program, PathBuf::from("nsenter"));
        assert!(wrapped_args.iter().any(|a| a == "--net=/proc/4242/ns/net"));
    }

    #[test]
    fn curated_env_overrides_home_user_pwd() {
        let env = sandbox_environment(&base_settings());
        let as_map: std::collections::HashMap<_, _> = env.into_iter().collect();
        assert_eq!(as_map.get("HOME").unwrap(), "/home/sandbox");
        assert_eq!(as_map.get("USER").unwrap(), "sandbox");
        assert_eq!(as_map.get("PWD").unwrap(), "/home/sandbox");
        assert_eq!(as_map.get("LANG").unwrap(), "C");
    }
}
