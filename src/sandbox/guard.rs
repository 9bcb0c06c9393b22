//! Sandbox admission control.
//!
//! Three gates run before any evaluation:
//!
//! 1. a length pre-filter;
//! 2. a fixed forbidden-pattern regex scan (fast rejection of the common
//!    escape idioms);
//! 3. a structural pass: parse to the sandbox AST (denied constructs are
//!    rejected by the parser itself) followed by an attribute
//!    post-filter over every `value.attr` node.

use std::sync::OnceLock;

use regex::Regex;

use crate::core::constants::MAX_CODE_LENGTH;
use crate::error::SandboxError;

use super::ast::{Expr, Stmt, parse, visit_exprs};

/// Attribute names denied outright (reflective escape hatches).
const DUNDER_DENYLIST: &[&str] = &[
    "__globals__",
    "__class__",
    "__bases__",
    "__closure__",
    "__subclasses__",
    "__dict__",
    "__mro__",
    "__code__",
    "__builtins__",
    "__import__",
    "__getattribute__",
    "__init_subclass__",
    "__reduce__",
];

struct ForbiddenPattern {
    regex: &'static str,
    description: &'static str,
}

const FORBIDDEN_PATTERNS: &[ForbiddenPattern] = &[
    ForbiddenPattern {
        regex: r"\b(?:import|__import__)\b",
        description: "import",
    },
    ForbiddenPattern {
        regex: r"\b(?:eval|exec|compile)\s*\(",
        description: "dynamic code execution",
    },
    ForbiddenPattern {
        regex: r"\bopen\s*\(",
        description: "direct file access",
    },
    ForbiddenPattern {
        regex: r"\b(?:getattr|setattr|delattr|vars|globals|locals)\s*\(",
        description: "reflective attribute access",
    },
    ForbiddenPattern {
        regex: r"__(?:globals|class|bases|closure|subclasses|dict|mro|code|builtins|getattribute|reduce)__",
        description: "dunder attribute",
    },
    ForbiddenPattern {
        regex: r"\b(?:os|sys|subprocess|shutil|socket|ctypes)\s*\.",
        description: "system module access",
    },
];

fn compiled_patterns() -> &'static Vec<(Regex, &'static str)> {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        FORBIDDEN_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p.regex).ok().map(|re| (re, p.description)))
            .collect()
    })
}

/// Validates code for sandbox execution, returning the parsed program.
///
/// # Errors
///
/// - [`SandboxError::CodeTooLong`] past the length pre-filter;
/// - [`SandboxError::ForbiddenPattern`] on a regex pre-filter hit;
/// - [`SandboxError::ForbiddenNode`] for denied constructs;
/// - [`SandboxError::ForbiddenAttribute`] from the attribute post-filter;
/// - [`SandboxError::Parse`] for malformed input.
pub fn validate(code: &str) -> Result<Vec<Stmt>, SandboxError> {
    if code.len() > MAX_CODE_LENGTH {
        return Err(SandboxError::CodeTooLong {
            len: code.len(),
            limit: MAX_CODE_LENGTH,
        });
    }

    for (regex, description) in compiled_patterns() {
        if regex.is_match(code) {
            return Err(SandboxError::ForbiddenPattern {
                description: (*description).to_string(),
            });
        }
    }

    let stmts = parse(code)?;

    // Attribute post-filter: anything starting with an underscore or on
    // the dunder denylist is rejected after tree validation.
    let mut violation: Option<String> = None;
    visit_exprs(&stmts, &mut |expr| {
        if let Expr::Attribute { attr, .. } = expr
            && violation.is_none()
            && (attr.starts_with('_') || DUNDER_DENYLIST.contains(&attr.as_str()))
        {
            violation = Some(attr.clone());
        }
    });
    if let Some(name) = violation {
        return Err(SandboxError::ForbiddenAttribute { name });
    }

    Ok(stmts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_accepts_plain_expressions() {
        assert!(validate("1 + 2").is_ok());
        assert!(validate("x = [i * 2 for i in range(10)]").is_ok());
        assert!(validate("'a'.upper()").is_ok());
    }

    #[test]
    fn test_length_prefilter() {
        let code = "1".repeat(MAX_CODE_LENGTH + 1);
        assert!(matches!(
            validate(&code),
            Err(SandboxError::CodeTooLong { .. })
        ));
    }

    #[test_case("__import__('os').system('rm -rf /')"; "dunder import")]
    #[test_case("import os"; "import statement")]
    #[test_case("eval('1+1')"; "eval")]
    #[test_case("exec('x = 1')"; "exec")]
    #[test_case("compile('x', 'f', 'eval')"; "compile")]
    #[test_case("open('/etc/passwd')"; "open")]
    #[test_case("getattr(x, 'secret')"; "getattr")]
    #[test_case("setattr(x, 'a', 1)"; "setattr")]
    #[test_case("x.__class__.__bases__"; "dunder chain")]
    #[test_case("().__class__.__subclasses__()"; "subclasses walk")]
    fn test_forbidden_patterns_rejected(code: &str) {
        assert!(matches!(
            validate(code),
            Err(SandboxError::ForbiddenPattern { .. })
        ));
    }

    #[test]
    fn test_forbidden_pattern_fires_before_parse() {
        // Even unparseable code is rejected by the pattern scan first.
        let err = validate("import os; ((((").unwrap_err();
        assert!(matches!(err, SandboxError::ForbiddenPattern { .. }));
    }

    #[test]
    fn test_denied_nodes_rejected_structurally() {
        for code in [
            "def f(): pass",
            "class C: pass",
            "while True: pass",
            "try: pass",
            "with ctx(): pass",
            "yield 5",
            "lambda_free = 1\nraise ValueError",
        ] {
            assert!(
                matches!(validate(code), Err(SandboxError::ForbiddenNode { .. })),
                "{code}"
            );
        }
    }

    #[test]
    fn test_underscore_attribute_rejected() {
        assert!(matches!(
            validate("x._private"),
            Err(SandboxError::ForbiddenAttribute { .. })
        ));
        assert!(matches!(
            validate("value._internal.method()"),
            Err(SandboxError::ForbiddenAttribute { .. })
        ));
    }

    #[test]
    fn test_allowed_attribute_passes() {
        assert!(validate("x.upper()").is_ok());
        assert!(validate("results.count(1)").is_ok());
    }

    #[test]
    fn test_helper_calls_pass() {
        assert!(validate("peek(0, 100)").is_ok());
        assert!(validate("grep('fn main', max_matches=5)").is_ok());
        assert!(validate("write_chunks(size=150000, semantic=True)").is_ok());
    }

    #[test]
    fn test_parse_error_surfaces() {
        assert!(matches!(
            validate("1 +"),
            Err(SandboxError::Parse { .. })
        ));
    }
}
