//! Per-language-family matcher tables.
//!
//! Each supported language is one `LanguageSpec` row: the extensions it
//! owns, how it is chunked, the declaration patterns that produce symbols
//! and the import patterns the graph builder scans for. Adding a language
//! means adding a row; nothing dispatches on a type hierarchy.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// How a file's text is split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LanguageFamily {
    /// Curly-brace languages, split on top-level declarations and depth.
    Brace,
    /// Indentation or `end`-terminated languages.
    Indent,
    /// Prose, split by paragraph.
    Doc,
    /// Anything else, fixed windows.
    Plain,
}

/// Kind of an extracted symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Method,
    Class,
    Struct,
    Interface,
    Trait,
    Enum,
    Type,
    Const,
    Module,
    /// Produced by the generic call-site heuristic for unknown languages.
    Call,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Class => "class",
            Self::Struct => "struct",
            Self::Interface => "interface",
            Self::Trait => "trait",
            Self::Enum => "enum",
            Self::Type => "type",
            Self::Const => "const",
            Self::Module => "module",
            Self::Call => "call",
        }
    }

    /// Kinds that name a callable.
    pub fn is_callable(&self) -> bool {
        matches!(self, Self::Function | Self::Method)
    }
}

/// How a declaration decides whether it is exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportRule {
    /// The declaration line contains this keyword (`pub`, `export`, `public`).
    Keyword(&'static str),
    /// Go: exported when the name starts with an uppercase letter.
    Capitalized,
    /// Python: exported unless the name starts with `_`.
    NoUnderscore,
    Always,
}

impl ExportRule {
    pub fn is_exported(&self, line: &str, name: &str) -> bool {
        match self {
            Self::Keyword(kw) => line
                .split(|c: char| !c.is_alphanumeric() && c != '_')
                .any(|w| w == *kw),
            Self::Capitalized => name.chars().next().is_some_and(|c| c.is_uppercase()),
            Self::NoUnderscore => !name.starts_with('_'),
            Self::Always => true,
        }
    }
}

/// How import specifiers are resolved to files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStyle {
    /// Relative paths with extension and `index.*` variants.
    Script,
    /// Dotted modules, leading dots are relative.
    Python,
    /// Paths under the `go.mod` module prefix.
    Go,
    /// `mod x;` and `crate::` paths.
    Rust,
    /// `#include "..."` relative to the file, then the root.
    Include,
    /// Dotted package paths mapped to source directories.
    Package,
    /// `require_relative` paths.
    Ruby,
    None,
}

/// A declaration pattern. Capture group 1 is the symbol name.
#[derive(Debug)]
pub struct DeclRule {
    pub pattern: Regex,
    pub kind: SymbolKind,
}

/// One row of the matcher table.
#[derive(Debug)]
pub struct LanguageSpec {
    pub name: &'static str,
    pub family: LanguageFamily,
    pub extensions: &'static [&'static str],
    /// Tried in order; the first match on a line wins.
    pub decls: Vec<DeclRule>,
    pub export: ExportRule,
    /// Capture group 1 is the specifier.
    pub imports: Vec<Regex>,
    pub import_style: ImportStyle,
    /// Extensions tried when resolving an extensionless specifier.
    pub resolve_extensions: &'static [&'static str],
}

impl LanguageSpec {
    pub fn is_code(&self) -> bool {
        matches!(self.family, LanguageFamily::Brace | LanguageFamily::Indent)
    }
}

fn re(pattern: &str) -> Regex {
    // Table patterns are literals; a bad one is a programming error.
    Regex::new(pattern).unwrap()
}

fn rule(pattern: &str, kind: SymbolKind) -> DeclRule {
    DeclRule {
        pattern: re(pattern),
        kind,
    }
}

const SCRIPT_EXTS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs"];

static TABLE: Lazy<Vec<LanguageSpec>> = Lazy::new(|| {
    use SymbolKind::*;
    vec![
        LanguageSpec {
            name: "rust",
            family: LanguageFamily::Brace,
            extensions: &["rs"],
            decls: vec![
                rule(r"^\s+(?:pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+([A-Za-z_]\w*)", Method),
                rule(r"^(?:pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?(?:extern\s+\S+\s+)?fn\s+([A-Za-z_]\w*)", Function),
                rule(r"^\s*(?:pub(?:\([^)]*\))?\s+)?struct\s+([A-Za-z_]\w*)", Struct),
                rule(r"^\s*(?:pub(?:\([^)]*\))?\s+)?enum\s+([A-Za-z_]\w*)", Enum),
                rule(r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:unsafe\s+)?trait\s+([A-Za-z_]\w*)", Trait),
                rule(r"^\s*(?:pub(?:\([^)]*\))?\s+)?type\s+([A-Za-z_]\w*)", Type),
                rule(r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:const|static)\s+(?:mut\s+)?([A-Z_][A-Z0-9_]*)\s*:", Const),
                rule(r"^\s*(?:pub(?:\([^)]*\))?\s+)?mod\s+([a-z_]\w*)", Module),
            ],
            export: ExportRule::Keyword("pub"),
            imports: vec![
                re(r"^\s*(?:pub(?:\([^)]*\))?\s+)?mod\s+([a-z_]\w*)\s*;"),
                re(r"^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+((?:crate|self|super)(?:::\w+)+)"),
                re(r"^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+([a-z_]\w*)(?:::|;)"),
            ],
            import_style: ImportStyle::Rust,
            resolve_extensions: &["rs"],
        },
        LanguageSpec {
            name: "go",
            family: LanguageFamily::Brace,
            extensions: &["go"],
            decls: vec![
                rule(r"^func\s+\([^)]*\)\s*([A-Za-z_]\w*)\s*[\(\[]", Method),
                rule(r"^func\s+([A-Za-z_]\w*)\s*[\(\[]", Function),
                rule(r"^type\s+([A-Za-z_]\w*)(?:\[[^\]]*\])?\s+struct\b", Struct),
                rule(r"^type\s+([A-Za-z_]\w*)(?:\[[^\]]*\])?\s+interface\b", Interface),
                rule(r"^type\s+([A-Za-z_]\w*)", Type),
                rule(r"^(?:const|var)\s+([A-Za-z_]\w*)", Const),
            ],
            export: ExportRule::Capitalized,
            imports: vec![
                re(r#"^\s*import\s+(?:[\w.]+\s+)?"([^"]+)""#),
                re(r#"^\s+(?:[\w.]+\s+)?"([^"]+)"\s*$"#),
            ],
            import_style: ImportStyle::Go,
            resolve_extensions: &["go"],
        },
        LanguageSpec {
            name: "typescript",
            family: LanguageFamily::Brace,
            extensions: &["ts", "tsx", "mts", "cts"],
            decls: script_decls(),
            export: ExportRule::Keyword("export"),
            imports: script_imports(),
            import_style: ImportStyle::Script,
            resolve_extensions: SCRIPT_EXTS,
        },
        LanguageSpec {
            name: "javascript",
            family: LanguageFamily::Brace,
            extensions: &["js", "jsx", "mjs", "cjs"],
            decls: script_decls(),
            export: ExportRule::Keyword("export"),
            imports: script_imports(),
            import_style: ImportStyle::Script,
            resolve_extensions: SCRIPT_EXTS,
        },
        LanguageSpec {
            name: "java",
            family: LanguageFamily::Brace,
            extensions: &["java", "kt", "kts", "scala", "cs"],
            decls: vec![
                rule(r"^\s*(?:(?:public|private|protected|internal|abstract|final|static|sealed|data|open|partial)\s+)*class\s+([A-Za-z_]\w*)", Class),
                rule(r"^\s*(?:(?:public|private|protected|internal|sealed)\s+)*interface\s+([A-Za-z_]\w*)", Interface),
                rule(r"^\s*(?:(?:public|private|protected|internal)\s+)*enum\s+(?:class\s+)?([A-Za-z_]\w*)", Enum),
                rule(r"^\s*(?:(?:public|private|protected|internal|override|suspend|inline|open)\s+)*fun\s+(?:<[^>]+>\s*)?(?:[\w.]+\.)?([A-Za-z_]\w*)\s*\(", Function),
                rule(r"^\s*(?:(?:public|private|protected|internal|static|final|abstract|synchronized|override|async|virtual)\s+)+[\w<>\[\],.?]+\s+([A-Za-z_]\w*)\s*\(", Method),
            ],
            export: ExportRule::Keyword("public"),
            imports: vec![re(r"^\s*import\s+(?:static\s+)?([\w.]+)")],
            import_style: ImportStyle::Package,
            resolve_extensions: &["java", "kt", "scala"],
        },
        LanguageSpec {
            name: "c",
            family: LanguageFamily::Brace,
            extensions: &["c", "h", "cpp", "hpp", "cc", "cxx", "hh"],
            decls: vec![
                rule(r"^\s*(?:typedef\s+)?struct\s+([A-Za-z_]\w*)", Struct),
                rule(r"^\s*(?:template\s*<[^>]*>\s*)?class\s+([A-Za-z_]\w*)", Class),
                rule(r"^\s*(?:typedef\s+)?enum\s+(?:class\s+)?([A-Za-z_]\w*)", Enum),
                rule(r"^\s*namespace\s+([A-Za-z_]\w*)", Module),
                rule(r"^#define\s+([A-Za-z_]\w*)", Const),
                rule(r"^[A-Za-z_][\w\s\*&:<>,]*?[\s\*&]([A-Za-z_]\w*)\s*\([^;]*$", Function),
            ],
            export: ExportRule::Always,
            imports: vec![re(r#"^\s*#\s*include\s+"([^"]+)""#)],
            import_style: ImportStyle::Include,
            resolve_extensions: &["h", "hpp"],
        },
        LanguageSpec {
            name: "swift",
            family: LanguageFamily::Brace,
            extensions: &["swift"],
            decls: vec![
                rule(r"^\s*(?:(?:public|private|internal|open|final|static)\s+)*func\s+([A-Za-z_]\w*)", Function),
                rule(r"^\s*(?:(?:public|private|internal|open|final)\s+)*class\s+([A-Za-z_]\w*)", Class),
                rule(r"^\s*(?:(?:public|private|internal)\s+)*struct\s+([A-Za-z_]\w*)", Struct),
                rule(r"^\s*(?:(?:public|private|internal)\s+)*protocol\s+([A-Za-z_]\w*)", Interface),
                rule(r"^\s*(?:(?:public|private|internal)\s+)*enum\s+([A-Za-z_]\w*)", Enum),
            ],
            export: ExportRule::Keyword("public"),
            imports: Vec::new(),
            import_style: ImportStyle::None,
            resolve_extensions: &[],
        },
        LanguageSpec {
            name: "php",
            family: LanguageFamily::Brace,
            extensions: &["php"],
            decls: vec![
                rule(r"^\s*(?:(?:public|private|protected|static|abstract|final)\s+)*function\s+&?([A-Za-z_]\w*)", Function),
                rule(r"^\s*(?:(?:abstract|final)\s+)*class\s+([A-Za-z_]\w*)", Class),
                rule(r"^\s*interface\s+([A-Za-z_]\w*)", Interface),
                rule(r"^\s*trait\s+([A-Za-z_]\w*)", Trait),
            ],
            export: ExportRule::Always,
            imports: vec![re(r#"^\s*(?:require|include)(?:_once)?\s*\(?\s*['"]([^'"]+)['"]"#)],
            import_style: ImportStyle::Script,
            resolve_extensions: &["php"],
        },
        LanguageSpec {
            name: "python",
            family: LanguageFamily::Indent,
            extensions: &["py", "pyi"],
            decls: vec![
                rule(r"^\s+(?:async\s+)?def\s+([A-Za-z_]\w*)", Method),
                rule(r"^(?:async\s+)?def\s+([A-Za-z_]\w*)", Function),
                rule(r"^\s*class\s+([A-Za-z_]\w*)", Class),
                rule(r"^([A-Z][A-Z0-9_]+)\s*(?::[^=]+)?=", Const),
            ],
            export: ExportRule::NoUnderscore,
            imports: vec![
                re(r"^\s*from\s+(\.*[\w.]*)\s+import\b"),
                re(r"^\s*import\s+([\w.]+)"),
            ],
            import_style: ImportStyle::Python,
            resolve_extensions: &["py"],
        },
        LanguageSpec {
            name: "ruby",
            family: LanguageFamily::Indent,
            extensions: &["rb", "rake"],
            decls: vec![
                rule(r"^\s+def\s+(?:self\.)?([A-Za-z_]\w*[!?=]?)", Method),
                rule(r"^def\s+(?:self\.)?([A-Za-z_]\w*[!?=]?)", Function),
                rule(r"^\s*class\s+([A-Z]\w*)", Class),
                rule(r"^\s*module\s+([A-Z]\w*)", Module),
            ],
            export: ExportRule::Always,
            imports: vec![re(r#"^\s*require_relative\s+['"]([^'"]+)['"]"#)],
            import_style: ImportStyle::Ruby,
            resolve_extensions: &["rb"],
        },
        LanguageSpec {
            name: "lua",
            family: LanguageFamily::Indent,
            extensions: &["lua"],
            decls: vec![rule(r"^\s*(?:local\s+)?function\s+(?:[\w.]+[.:])?([A-Za-z_]\w*)", Function)],
            export: ExportRule::Always,
            imports: Vec::new(),
            import_style: ImportStyle::None,
            resolve_extensions: &[],
        },
        LanguageSpec {
            name: "elixir",
            family: LanguageFamily::Indent,
            extensions: &["ex", "exs"],
            decls: vec![
                rule(r"^\s*defmodule\s+([\w.]+)", Module),
                rule(r"^\s*defp?\s+([a-z_]\w*[!?]?)", Function),
            ],
            export: ExportRule::Always,
            imports: Vec::new(),
            import_style: ImportStyle::None,
            resolve_extensions: &[],
        },
        LanguageSpec {
            name: "markdown",
            family: LanguageFamily::Doc,
            extensions: &["md", "mdx", "markdown", "rst", "txt", "adoc"],
            decls: Vec::new(),
            export: ExportRule::Always,
            imports: Vec::new(),
            import_style: ImportStyle::None,
            resolve_extensions: &[],
        },
    ]
});

static PLAIN: Lazy<LanguageSpec> = Lazy::new(|| LanguageSpec {
    name: "plain",
    family: LanguageFamily::Plain,
    extensions: &[],
    decls: Vec::new(),
    export: ExportRule::Always,
    imports: Vec::new(),
    import_style: ImportStyle::None,
    resolve_extensions: &[],
});

fn script_decls() -> Vec<DeclRule> {
    use SymbolKind::*;
    vec![
        rule(r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)", Function),
        rule(r"^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+([A-Za-z_$][\w$]*)", Class),
        rule(r"^\s*(?:export\s+)?(?:declare\s+)?interface\s+([A-Za-z_$][\w$]*)", Interface),
        rule(r"^\s*(?:export\s+)?(?:declare\s+)?type\s+([A-Za-z_$][\w$]*)\s*(?:<[^=]*>)?\s*=", Type),
        rule(r"^\s*(?:export\s+)?(?:declare\s+)?(?:const\s+)?enum\s+([A-Za-z_$][\w$]*)", Enum),
        rule(r"^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*(?::[^=]+)?=\s*(?:async\s+)?(?:function\b|(?:\([^)]*\)|[A-Za-z_$][\w$]*)\s*(?::[^=]+)?=>)", Function),
        rule(r"^\s*(?:export\s+)?const\s+([A-Z][A-Z0-9_]+)\s*(?::[^=]+)?=", Const),
        rule(r"^\s+(?:(?:public|private|protected|static|async|readonly|override|get|set)\s+)*([A-Za-z_$][\w$]*)\s*\([^)]*\)\s*(?::\s*[^{]+)?\{\s*$", Method),
    ]
}

fn script_imports() -> Vec<Regex> {
    vec![
        re(r#"^\s*import\s+(?:type\s+)?[^'"]*?\s+from\s+['"]([^'"]+)['"]"#),
        re(r#"^\s*import\s+['"]([^'"]+)['"]"#),
        re(r#"^\s*export\s+[^'"]*?\s+from\s+['"]([^'"]+)['"]"#),
        re(r#"\brequire\(\s*['"]([^'"]+)['"]\s*\)"#),
        re(r#"\bimport\(\s*['"]([^'"]+)['"]\s*\)"#),
    ]
}

/// Words the call-site heuristic never treats as names.
pub const CONTROL_KEYWORDS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "return", "match", "elif", "else", "sizeof",
    "typeof", "function", "fn", "def", "func", "new", "await", "yield", "not", "and", "or",
    "with", "print", "assert", "super", "this", "self", "loop", "when", "unless", "until",
];

/// Generic call-site heuristic used for unknown extensions.
pub static CALL_SITE: Lazy<Regex> = Lazy::new(|| re(r"^\s*([A-Za-z_]\w*)\s*\("));

/// Look up the table row for a file, falling back to plain text.
pub fn spec_for_path(path: &Path) -> &'static LanguageSpec {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(spec_for_extension)
        .unwrap_or(&*PLAIN)
}

pub fn spec_for_extension(ext: &str) -> Option<&'static LanguageSpec> {
    let ext = ext.to_ascii_lowercase();
    TABLE.iter().find(|s| s.extensions.contains(&ext.as_str()))
}

/// Extensions that never hold text worth indexing.
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "tiff", "psd", "pdf", "zip", "gz", "tgz",
    "bz2", "xz", "7z", "rar", "tar", "jar", "war", "class", "o", "a", "so", "dylib", "dll", "exe",
    "bin", "obj", "lib", "wasm", "pyc", "pyo", "woff", "woff2", "ttf", "otf", "eot", "mp3", "mp4",
    "mov", "avi", "wav", "flac", "ogg", "webm", "sqlite", "db", "dat", "pack", "idx",
];

/// Bytes inspected when deciding whether a file is text.
const SNIFF_BYTES: usize = 8 * 1024;

pub fn has_binary_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| BINARY_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Whether a file should be indexed. Known extensions always are. Anything
/// else is indexed as plain text unless its extension is a binary format or
/// its leading bytes contain a NUL.
pub fn is_indexable(path: &Path) -> bool {
    has_known_extension(path) || (!has_binary_extension(path) && looks_like_text(path))
}

/// Whether the extension belongs to a row of the table.
pub fn has_known_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(spec_for_extension)
        .is_some()
}

fn looks_like_text(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut buf = vec![0u8; SNIFF_BYTES];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return false,
        }
    }
    !buf[..filled].contains(&0u8)
}
