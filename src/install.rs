use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const OS_RELEASE: &str = "/etc/os-release";
const GENERIC_HINT: &str =
    "Please install shadowsocks-rust using your package manager or cargo.";

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn candidates(dir: &Path, program: &str) -> Vec<PathBuf> {
    let mut list = vec![dir.join(program)];
    if cfg!(windows) && Path::new(program).extension().is_none() {
        list.push(dir.join(format!("{program}.exe")));
    }
    list
}

/// Resolves `program` the way a shell would: paths are checked directly,
/// bare names are searched on `PATH`.
pub fn locate_executable(program: &str) -> Option<PathBuf> {
    let program = program.trim();
    if program.is_empty() {
        return None;
    }
    if program.contains('/') || program.contains('\\') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .flat_map(|dir| candidates(&dir, program))
        .find(|path| is_executable(path))
}

/// `KEY=value` pairs of an os-release file, quotes stripped.
pub fn parse_os_release(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            (
                key.trim().to_string(),
                value.trim().trim_matches(|c| c == '"' || c == '\'').to_string(),
            )
        })
        .collect()
}

/// Package manager command for shadowsocks-rust on the described distro.
pub fn install_command(info: &HashMap<String, String>) -> &'static str {
    let id = info.get("ID").map(|v| v.to_lowercase()).unwrap_or_default();
    let like = info
        .get("ID_LIKE")
        .map(|v| v.to_lowercase())
        .unwrap_or_default();
    let like: Vec<&str> = like.split_whitespace().collect();
    let is = |name: &str| id == name || like.contains(&name);

    if is("fedora") {
        "sudo dnf install shadowsocks-rust"
    } else if id == "ubuntu" || is("debian") {
        "sudo apt update && sudo apt install shadowsocks-rust"
    } else if is("arch") {
        "sudo pacman -S shadowsocks-rust"
    } else if id.starts_with("opensuse") || is("suse") {
        "sudo zypper install shadowsocks-rust"
    } else {
        GENERIC_HINT
    }
}

/// Remediation text for a missing proxy executable on this host.
pub fn install_hint() -> String {
    if !cfg!(target_os = "linux") {
        return GENERIC_HINT.to_string();
    }
    match fs::read_to_string(OS_RELEASE) {
        Ok(content) => install_command(&parse_os_release(&content)).to_string(),
        Err(_) => GENERIC_HINT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(text: &str) -> &'static str {
        install_command(&parse_os_release(text))
    }

    #[test]
    fn test_parse_os_release() {
        let info = parse_os_release("NAME=\"Fedora Linux\"\nID=fedora\n# comment\nVERSION_ID=40\n");
        assert_eq!(info.get("NAME").map(String::as_str), Some("Fedora Linux"));
        assert_eq!(info.get("ID").map(String::as_str), Some("fedora"));
        assert!(!info.contains_key("# comment"));
    }

    #[test]
    fn test_install_command_by_distro() {
        assert_eq!(release("ID=fedora"), "sudo dnf install shadowsocks-rust");
        assert_eq!(
            release("ID=linuxmint\nID_LIKE=\"ubuntu debian\""),
            "sudo apt update && sudo apt install shadowsocks-rust"
        );
        assert_eq!(release("ID=endeavouros\nID_LIKE=arch"), "sudo pacman -S shadowsocks-rust");
        assert_eq!(
            release("ID=\"opensuse-tumbleweed\"\nID_LIKE=\"opensuse suse\""),
            "sudo zypper install shadowsocks-rust"
        );
        assert_eq!(release("ID=gentoo"), GENERIC_HINT);
        assert_eq!(release(""), GENERIC_HINT);
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_executable() {
        assert!(locate_executable("sh").is_some());
        assert!(locate_executable("/bin/sh").is_some());
        assert_eq!(locate_executable("socksicle-no-such-binary"), None);
        assert_eq!(locate_executable(""), None);
    }
}
