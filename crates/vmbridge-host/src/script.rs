//! Guest script preparation.
//!
//! Requirement and provisioning scripts must see the parameters delivered
//! on the cidata volume as environment variables. Instead of asking every
//! script to source the file itself, the host rewrites the script into a
//! `/bin/sh` wrapper that exports `param.env` and then feeds the original
//! script, byte for byte, to its own interpreter.
//!
//! The wrapper reproduces the script through `printf`, so the escaping
//! rules matter: `%` doubles (printf format), `'` becomes `'"'"'` (shell
//! quoting), `\` doubles and newlines become `\n` (printf escapes). The
//! wrapper must run under busybox ash, hence printf rather than any
//! bashism.

use vmbridge_common::constants::CIDATA_PARAM_ENV;

/// Extracts the interpreter command from a shebang line, arguments
/// included.
#[must_use]
pub fn extract_interpreter(script: &str) -> Option<&str> {
    let first_line = script.lines().next()?;
    let interpreter = first_line.strip_prefix("#!")?.trim();
    if interpreter.is_empty() { None } else { Some(interpreter) }
}

/// Escapes arbitrary script text for use inside a single-quoted printf
/// format string.
#[must_use]
pub fn escape_for_printf(script: &str) -> String {
    let mut escaped = String::with_capacity(script.len() + script.len() / 8);
    for ch in script.chars() {
        match ch {
            '%' => escaped.push_str("%%"),
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("'\"'\"'"),
            '\n' => escaped.push_str("\\n"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Wraps a script so that `param.env` is exported before its interpreter
/// runs. The original bytes reach the interpreter unchanged on stdin.
#[must_use]
pub fn prefix_export_param(script: &str) -> String {
    let interpreter = extract_interpreter(script).unwrap_or("/bin/sh");
    let escaped = escape_for_printf(script);
    format!(
        "#!/bin/sh\n\
         set -a\n\
         [ -r {CIDATA_PARAM_ENV} ] && . {CIDATA_PARAM_ENV}\n\
         set +a\n\
         printf '{escaped}' | {interpreter}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpreter_comes_from_shebang() {
        assert_eq!(
            extract_interpreter("#!/usr/bin/env python3\nprint('hi')\n"),
            Some("/usr/bin/env python3")
        );
        assert_eq!(extract_interpreter("#!/bin/bash -eu\necho ok\n"), Some("/bin/bash -eu"));
        assert_eq!(extract_interpreter("echo no shebang\n"), None);
        assert_eq!(extract_interpreter("#!\necho empty\n"), None);
    }

    #[test]
    fn percent_doubles() {
        assert_eq!(escape_for_printf("date +%s"), "date +%%s");
    }

    #[test]
    fn single_quote_escapes_shell_style() {
        assert_eq!(escape_for_printf("echo 'hi'"), r#"echo '"'"'hi'"'"'"#);
    }

    #[test]
    fn newline_becomes_printf_escape() {
        assert_eq!(escape_for_printf("a\nb\n"), "a\\nb\\n");
    }

    #[test]
    fn backslash_doubles() {
        assert_eq!(escape_for_printf(r"echo a\tb"), r"echo a\\tb");
    }

    #[test]
    fn wrapper_exports_param_env_before_interpreter() {
        let script = "#!/bin/bash\necho \"$PARAM_NAME\"\n";
        let wrapped = prefix_export_param(script);

        let lines: Vec<&str> = wrapped.lines().collect();
        assert_eq!(lines[0], "#!/bin/sh");
        assert_eq!(lines[1], "set -a");
        assert!(lines[2].contains(CIDATA_PARAM_ENV));
        assert_eq!(lines[3], "set +a");
        assert!(lines[4].starts_with("printf '"));
        assert!(lines[4].ends_with("| /bin/bash"));
    }

    #[test]
    fn shebang_less_script_falls_back_to_sh() {
        let wrapped = prefix_export_param("echo plain\n");
        assert!(wrapped.ends_with("| /bin/sh\n"));
    }

    #[test]
    fn wrapped_script_preserves_original_bytes_in_format() {
        let script = "#!/bin/sh\nprintf '%s' \"100%\"\n";
        let wrapped = prefix_export_param(script);
        // The original with printf escapes applied must appear verbatim.
        assert!(wrapped.contains(
            r#"#!/bin/sh\nprintf '"'"'%%s'"'"' "100%%"\n"#
        ));
    }
}
