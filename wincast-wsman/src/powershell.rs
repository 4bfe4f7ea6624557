//! Helpers for handing scripts to `powershell.exe` through `cmd`.

use base64::{Engine, engine::general_purpose::STANDARD};

/// Encode a script the way `-EncodedCommand` expects it: UTF-16LE, then
/// base64. Nothing in the result needs quoting in XML or `cmd`.
pub fn encode_command(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    STANDARD.encode(bytes)
}

/// A `cmd` command line that runs the given script.
pub fn command(script: &str) -> String {
    format!(
        "powershell.exe -NoProfile -NonInteractive -ExecutionPolicy Bypass -EncodedCommand {}",
        encode_command(script)
    )
}

/// Quote a value as a single-quoted PowerShell string literal.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        // UTF-16LE of "dir"
        assert_eq!(encode_command("dir"), "ZABpAHIA");
    }

    #[test]
    fn test_command() {
        assert!(command("exit 1").ends_with("-EncodedCommand ZQB4AGkAdAAgADEA"));
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("C:\\it's"), "'C:\\it''s'");
    }
}
