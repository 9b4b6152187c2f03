//! Import allow-listing for generated page source.
//!
//! A page may only reach crates named in its [`ImportAllowList`]. The
//! support crate itself ([`SUPPORT_CRATE`]) is always reachable.

use crate::error::CompileError;
use proc_macro2::{Spacing, TokenStream, TokenTree};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use syn::visit::{self, Visit};

/// Name of the crate every generated page depends on.
pub const SUPPORT_CRATE: &str = "gosp";

const PRIMITIVES: &[&str] = &[
    "bool", "char", "str", "i8", "i16", "i32", "i64", "i128", "isize", "u8", "u16", "u32", "u64",
    "u128", "usize", "f32", "f64",
];

const PATH_KEYWORDS: &[&str] = &["self", "super", "crate", "Self"];

/// Set of crate names a page is allowed to use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportAllowList {
    names: BTreeSet<String>,
    all: bool,
}

impl ImportAllowList {
    /// A list that permits every crate.
    pub fn all() -> Self {
        Self {
            names: BTreeSet::new(),
            all: true,
        }
    }

    /// A list that permits nothing beyond the support crate.
    pub fn none() -> Self {
        Self::default()
    }

    /// Apply a comma-separated list left to right. `NONE` clears the set,
    /// `ALL` clears it and makes it universal, any other name is added
    /// unless the set is already universal.
    pub fn apply(&mut self, list: &str) -> Result<(), CompileError> {
        if list.trim().is_empty() {
            return Err(CompileError::AllowList("list must be non-empty".into()));
        }
        for name in list.split(',').map(str::trim) {
            match name {
                "" => {
                    return Err(CompileError::AllowList(format!(
                        "empty element in list {:?}",
                        list
                    )))
                }
                "NONE" => *self = Self::none(),
                "ALL" => *self = Self::all(),
                _ if self.all => {}
                _ => {
                    self.names.insert(name.to_string());
                }
            }
        }
        Ok(())
    }

    pub fn is_universal(&self) -> bool {
        self.all
    }

    pub fn allows(&self, name: &str) -> bool {
        self.all || name == SUPPORT_CRATE || self.names.contains(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl FromStr for ImportAllowList {
    type Err = CompileError;

    fn from_str(list: &str) -> Result<Self, Self::Err> {
        let mut allowed = Self::none();
        allowed.apply(list)?;
        Ok(allowed)
    }
}

impl fmt::Display for ImportAllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.all {
            return f.write_str("ALL");
        }
        if self.names.is_empty() {
            return f.write_str("NONE");
        }
        let names: Vec<&str> = self.names().collect();
        f.write_str(&names.join(","))
    }
}

/// Fail if `source` reaches any crate that `allowed` does not permit.
///
/// `page` names the page in the diagnostic.
pub fn validate_imports(
    source: &str,
    page: &str,
    allowed: &ImportAllowList,
) -> Result<(), CompileError> {
    if allowed.is_universal() {
        return Ok(());
    }
    for name in capabilities(source)? {
        if name == SUPPORT_CRATE {
            continue;
        }
        if !allowed.allows(&name) {
            return Err(CompileError::ImportRejected {
                name,
                page: page.to_string(),
                allowed: allowed.to_string(),
            });
        }
    }
    Ok(())
}

/// Crates referenced by `source`, in order of first appearance.
pub fn capabilities(source: &str) -> Result<Vec<String>, CompileError> {
    let file = syn::parse_file(source)?;
    let mut collector = Collector::default();
    collector.visit_file(&file);
    Ok(collector.finish())
}

#[derive(Clone, Copy, PartialEq)]
enum Origin {
    /// Root of a `use` tree or an `extern crate` item.
    Declared,
    /// Root of a path used in code; may turn out to be a local module.
    Referenced,
}

#[derive(Default)]
struct Collector {
    roots: Vec<(String, Origin)>,
    locals: HashSet<String>,
}

impl Collector {
    fn root(&mut self, name: String, origin: Origin) {
        let name = name.strip_prefix("r#").map(str::to_string).unwrap_or(name);
        if PATH_KEYWORDS.contains(&name.as_str()) {
            return;
        }
        self.roots.push((name, origin));
    }

    fn bind(&mut self, tree: &syn::UseTree) {
        match tree {
            syn::UseTree::Path(p) => self.bind(&p.tree),
            syn::UseTree::Name(n) => {
                self.locals.insert(n.ident.to_string());
            }
            syn::UseTree::Rename(r) => {
                self.locals.insert(r.rename.to_string());
            }
            syn::UseTree::Glob(_) => {}
            syn::UseTree::Group(g) => g.items.iter().for_each(|t| self.bind(t)),
        }
    }

    fn use_roots(&mut self, tree: &syn::UseTree) {
        match tree {
            syn::UseTree::Path(p) => self.root(p.ident.to_string(), Origin::Declared),
            syn::UseTree::Name(n) => self.root(n.ident.to_string(), Origin::Declared),
            syn::UseTree::Rename(r) => self.root(r.ident.to_string(), Origin::Declared),
            syn::UseTree::Glob(_) => {}
            syn::UseTree::Group(g) => g.items.iter().for_each(|t| self.use_roots(t)),
        }
    }

    /// Find `name::` path roots inside unparsed token streams (macro
    /// arguments, attribute arguments).
    fn scan_tokens(&mut self, tokens: TokenStream) {
        let trees: Vec<TokenTree> = tokens.into_iter().collect();
        for (i, tree) in trees.iter().enumerate() {
            match tree {
                TokenTree::Group(group) => self.scan_tokens(group.stream()),
                TokenTree::Ident(ident) if is_path_sep(&trees, i + 1) => {
                    // `.name::<T>()` and `name::<T>` are turbofish, not paths.
                    let method = i >= 1 && is_punct(&trees[i - 1], '.');
                    let turbofish = trees.get(i + 3).is_some_and(|t| is_punct(t, '<'));
                    if method || turbofish {
                        continue;
                    }
                    let after_sep = i >= 2 && is_path_sep(&trees, i - 2);
                    let leading = after_sep
                        && (i == 2
                            || !matches!(&trees[i - 3], TokenTree::Ident(_) | TokenTree::Group(_))
                                && !is_punct(&trees[i - 3], '>'));
                    if !after_sep || leading {
                        self.root(ident.to_string(), Origin::Referenced);
                    }
                }
                _ => {}
            }
        }
    }

    fn finish(self) -> Vec<String> {
        let Collector { roots, locals } = self;
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        for (name, origin) in roots {
            if origin == Origin::Referenced && !is_crate_like(&locals, &name) {
                continue;
            }
            if seen.insert(name.clone()) {
                names.push(name);
            }
        }
        names
    }
}

fn is_crate_like(locals: &HashSet<String>, name: &str) -> bool {
    !locals.contains(name)
        && !PRIMITIVES.contains(&name)
        && !name.starts_with(|c: char| c.is_uppercase())
}

fn is_punct(tree: &TokenTree, c: char) -> bool {
    matches!(tree, TokenTree::Punct(p) if p.as_char() == c)
}

fn is_path_sep(trees: &[TokenTree], i: usize) -> bool {
    match (trees.get(i), trees.get(i + 1)) {
        (Some(TokenTree::Punct(a)), Some(TokenTree::Punct(b))) => {
            a.as_char() == ':' && a.spacing() == Spacing::Joint && b.as_char() == ':'
        }
        _ => false,
    }
}

impl<'ast> Visit<'ast> for Collector {
    fn visit_item_use(&mut self, item: &'ast syn::ItemUse) {
        self.use_roots(&item.tree);
        self.bind(&item.tree);
    }

    fn visit_item_extern_crate(&mut self, item: &'ast syn::ItemExternCrate) {
        self.root(item.ident.to_string(), Origin::Declared);
        if let Some((_, rename)) = &item.rename {
            self.locals.insert(rename.to_string());
        }
    }

    fn visit_item_mod(&mut self, item: &'ast syn::ItemMod) {
        self.locals.insert(item.ident.to_string());
        visit::visit_item_mod(self, item);
    }

    fn visit_path(&mut self, path: &'ast syn::Path) {
        if path.segments.len() > 1 || path.leading_colon.is_some() {
            if let Some(first) = path.segments.first() {
                self.root(first.ident.to_string(), Origin::Referenced);
            }
        }
        visit::visit_path(self, path);
    }

    fn visit_macro(&mut self, mac: &'ast syn::Macro) {
        visit::visit_macro(self, mac);
        self.scan_tokens(mac.tokens.clone());
    }

    fn visit_meta_list(&mut self, list: &'ast syn::MetaList) {
        visit::visit_meta_list(self, list);
        self.scan_tokens(list.tokens.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(list: &str) -> ImportAllowList {
        list.parse().unwrap()
    }

    #[test]
    fn none_then_names() {
        let list = allow("NONE,foo,bar");
        assert!(!list.is_universal());
        assert_eq!(list.names().collect::<Vec<_>>(), vec!["bar", "foo"]);
    }

    #[test]
    fn all_absorbs_later_names() {
        let list = allow("foo,ALL,bar");
        assert!(list.is_universal());
        assert_eq!(list.names().count(), 0);
        assert_eq!(list.to_string(), "ALL");
    }

    #[test]
    fn none_clears_earlier_names() {
        let list = allow("foo,ALL,NONE,baz");
        assert_eq!(list.to_string(), "baz");
        assert_eq!(allow("foo,NONE").to_string(), "NONE");
    }

    #[test]
    fn empty_lists_are_rejected() {
        assert!("".parse::<ImportAllowList>().is_err());
        assert!("foo,,bar".parse::<ImportAllowList>().is_err());
    }

    #[test]
    fn support_crate_is_always_allowed() {
        assert!(ImportAllowList::none().allows(SUPPORT_CRATE));
        let src = "fn main() { gosp::serve_main(page) } fn page() {}";
        validate_imports(src, "p", &ImportAllowList::none()).unwrap();
    }

    #[test]
    fn rejects_first_unlisted_crate() {
        let src = r#"
            use foo::Thing;
            use baz::{self, other};
            fn f() { bar::go(); }
        "#;
        let err = validate_imports(src, "page.gosp", &allow("foo,bar")).unwrap_err();
        match err {
            CompileError::ImportRejected { name, allowed, .. } => {
                assert_eq!(name, "baz");
                assert_eq!(allowed, "bar,foo");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn fully_qualified_paths_count() {
        let src = "fn f() -> String { std::fs::read_to_string(\"x\").unwrap_or_default() }";
        assert_eq!(capabilities(src).unwrap(), vec!["std"]);
        assert!(validate_imports(src, "p", &ImportAllowList::none()).is_err());
    }

    #[test]
    fn paths_inside_macros_count() {
        let src = r#"fn f() { gosp::print(out, format_args!("{}", ::std::process::id())); }"#;
        assert_eq!(capabilities(src).unwrap(), vec!["gosp", "std"]);
    }

    #[test]
    fn local_names_are_not_crates() {
        let src = r#"
            use std::collections;
            mod helpers { pub fn twice(x: i32) -> i32 { x * 2 } }
            fn f() -> usize {
                let v: Vec<u8> = Vec::new();
                let _ = i32::MAX;
                let _ = collections::HashMap::<u8, u8>::new();
                helpers::twice(3) as usize + v.len() + self::g()
            }
            fn g() -> usize { 0 }
        "#;
        assert_eq!(capabilities(src).unwrap(), vec!["std"]);
    }

    #[test]
    fn turbofish_inside_macros_is_not_a_crate() {
        let src = r#"
            fn convert<T: From<u8>>(x: u8) -> T { T::from(x) }
            fn f(out: &mut String) {
                let v = [1u32, 2];
                gosp::print(out, format_args!("{}", v.iter().sum::<u32>()));
                gosp::print(out, format_args!("{:?}", v.iter().collect::<Vec<_>>()));
                gosp::print(out, format_args!("{}", convert::<u64>(3)));
                gosp::print(out, format_args!("{}", std::mem::size_of::<u8>()));
            }
        "#;
        assert_eq!(capabilities(src).unwrap(), vec!["gosp", "std"]);
        validate_imports(src, "p", &allow("std")).unwrap();
    }

    #[test]
    fn names_bound_by_use_are_local_inside_macros() {
        let src = r#"
            use std::fmt as f;
            fn g(out: &mut String) { gosp::print(out, format_args!("{}", f::Error)); }
        "#;
        assert_eq!(capabilities(src).unwrap(), vec!["std", "gosp"]);
    }

    #[test]
    fn unparsable_source_is_an_error() {
        let err = validate_imports("fn (", "p", &allow("foo")).unwrap_err();
        assert!(matches!(err, CompileError::Parse(_)));
    }

    #[test]
    fn universal_list_skips_parsing() {
        validate_imports("not rust at all", "p", &ImportAllowList::all()).unwrap();
    }
}
