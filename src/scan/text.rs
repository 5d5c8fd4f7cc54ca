//! Text-versus-binary classification for scanned files.

use std::io::Read;
use std::path::Path;

/// Bytes inspected when sniffing file content.
const SNIFF_LEN: usize = 8192;

/// Extensions indexed when a corpus does not list its own.
const TEXT_EXTENSIONS: &[&str] = &[
    // Systems
    "rs", "c", "h", "cc", "cpp", "cxx", "hpp", "hxx", "go", "zig", "swift",
    // JVM and .NET
    "java", "kt", "kts", "scala", "cs", "fs",
    // Scripting
    "py", "pyi", "rb", "rake", "php", "pl", "lua", "sh", "bash", "zsh", "fish", "ps1",
    // Web
    "js", "mjs", "cjs", "ts", "mts", "cts", "tsx", "jsx", "vue", "svelte", "html", "htm", "css",
    "scss", "sass", "less",
    // Functional
    "hs", "ml", "mli", "ex", "exs", "erl", "clj", "elm",
    // Data and config
    "json", "yaml", "yml", "toml", "ini", "cfg", "conf", "xml", "csv", "sql", "graphql", "proto",
    "env",
    // Prose
    "md", "markdown", "mdx", "txt", "rst", "adoc", "org", "tex",
];

/// Extension-less file names that are still worth indexing.
const TEXT_FILE_NAMES: &[&str] = &[
    "Makefile",
    "Dockerfile",
    "Justfile",
    "Rakefile",
    "Gemfile",
    "README",
    "LICENSE",
    "CHANGELOG",
];

/// Whether a file passes the default allow-list.
pub(crate) fn is_text_file(file_name: &str, extension: Option<&str>) -> bool {
    match extension {
        Some(ext) => TEXT_EXTENSIONS.contains(&ext),
        None => TEXT_FILE_NAMES.contains(&file_name),
    }
}

/// Null bytes in the leading chunk mark a file as binary.
pub(crate) fn looks_binary(data: &[u8]) -> bool {
    data[..data.len().min(SNIFF_LEN)].contains(&0)
}

/// Reads the leading chunk of a file and sniffs it.
pub(crate) fn sniff_binary(path: &Path) -> std::io::Result<bool> {
    let mut file = std::fs::File::open(path)?;
    let mut buffer = [0u8; SNIFF_LEN];
    let read = file.read(&mut buffer)?;
    Ok(looks_binary(&buffer[..read]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::check;
    use rstest::rstest;

    #[rstest]
    #[case("main.rs", Some("rs"), true)]
    #[case("notes.md", Some("md"), true)]
    #[case("Makefile", None, true)]
    #[case("logo.png", Some("png"), false)]
    #[case("app.exe", Some("exe"), false)]
    #[case("Cargo.lock", Some("lock"), false)]
    #[case("random", None, false)]
    fn test_is_text_file(#[case] name: &str, #[case] ext: Option<&str>, #[case] expected: bool) {
        check!(is_text_file(name, ext) == expected);
    }

    #[test]
    fn test_looks_binary() {
        check!(!looks_binary(b"plain text\nwith lines"));
        check!(looks_binary(b"\x7fELF\x00\x01"));
        check!(!looks_binary(b""));
    }
}
