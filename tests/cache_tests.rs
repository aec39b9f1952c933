//! Cache properties: the resident set matches an LRU reference model under
//! generated access patterns, and file changes invalidate deterministically.

use quill::ast::{ComponentNode, Document};
use quill::{AstCache, ExpressionEngine};
use serde_json::json;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

fn component(name: &str) -> Document {
    Document::Component(ComponentNode {
        name: name.into(),
        statements: vec![],
    })
}

fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.sync_all().unwrap();
    path
}

/// Reference LRU model: ordered vector, most recent last.
struct LruModel {
    capacity: usize,
    keys: Vec<String>,
}

impl LruModel {
    fn touch(&mut self, key: &str) {
        self.keys.retain(|k| k != key);
        self.keys.push(key.to_string());
        while self.keys.len() > self.capacity {
            self.keys.remove(0);
        }
    }
}

#[test]
fn resident_set_matches_lru_reference_model() {
    const CAPACITY: usize = 4;
    let dir = tempfile::tempdir().unwrap();

    // 4N distinct keys accessed through a deterministic pseudo-random walk.
    let paths: Vec<PathBuf> = (0..CAPACITY * 4)
        .map(|i| write_file(&dir, &format!("f{}.q", i), &format!("content {}", i)))
        .collect();

    let cache = AstCache::new(CAPACITY, false);
    let mut model = LruModel {
        capacity: CAPACITY,
        keys: Vec::new(),
    };

    // Linear-congruential walk keeps the test reproducible.
    let mut state: u64 = 0x2545_F491_4F6C_DD1D;
    for _ in 0..200 {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let index = (state >> 33) as usize % paths.len();
        let path = &paths[index];

        cache
            .get_or_parse(path, |_| Ok(component("x")), None)
            .unwrap();
        model.touch(&path.canonicalize().unwrap().to_string_lossy());

        let mut resident = cache.resident_keys();
        resident.sort();
        let mut expected = model.keys.clone();
        expected.sort();
        assert_eq!(resident, expected, "resident set diverged from the model");
    }
}

#[test]
fn invalidate_then_get_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "a.q", "v1");
    let cache = AstCache::default();

    cache
        .get_or_parse(&path, |_| Ok(component("a")), None)
        .unwrap();
    assert!(cache.get(&path).is_some());

    cache.invalidate(Some(path.to_str().unwrap()));
    assert!(cache.get(&path).is_none());
}

#[test]
fn unchanged_file_parses_at_most_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "a.q", "stable");
    let cache = AstCache::default();

    let mut parses = 0;
    for _ in 0..10 {
        cache
            .get_or_parse(
                &path,
                |_| {
                    parses += 1;
                    Ok(component("a"))
                },
                None,
            )
            .unwrap();
    }
    assert_eq!(parses, 1);
    assert_eq!(cache.stats().hits, 9);
}

#[test]
fn transitive_dependents_invalidate() {
    let dir = tempfile::tempdir().unwrap();
    let base = write_file(&dir, "base.q", "base");
    let layout = write_file(&dir, "layout.q", "layout");
    let page = write_file(&dir, "page.q", "page");

    let cache = AstCache::default();
    for path in [&base, &layout, &page] {
        cache
            .get_or_parse(path, |_| Ok(component("x")), None)
            .unwrap();
    }
    // page imports layout imports base.
    cache.register_dependency(&layout, &base);
    cache.register_dependency(&page, &layout);

    cache.invalidate(Some(base.to_str().unwrap()));
    assert!(cache.get(&base).is_none());
    assert!(cache.get(&layout).is_none());
    assert!(cache.get(&page).is_none());
}

/// Reference-model check for the expression engine: a table of expressions
/// and their expected values, evaluated twice to confirm purity.
#[test]
fn expression_reference_table() {
    let engine = ExpressionEngine::default();
    let mut context = HashMap::new();
    context.insert("x".to_string(), json!(10));
    context.insert("name".to_string(), json!("quill"));
    context.insert("items".to_string(), json!([3, 1, 2]));

    let table = [
        ("x + 5", json!(15)),
        ("x * 2 - 1", json!(19)),
        ("x / 4", json!(2.5)),
        ("x // 4", json!(2)),
        ("x % 3", json!(1)),
        ("-x + 1", json!(-9)),
        ("x > 5 and x < 20", json!(true)),
        ("not (x == 10)", json!(false)),
        ("'big' if x > 5 else 'small'", json!("big")),
        ("name + '!'", json!("quill!")),
        ("len(name)", json!(5)),
        ("sorted(items)", json!([1, 2, 3])),
        ("sum(items) + max(items)", json!(9)),
        ("items[0] + items[-1]", json!(5)),
        ("min(x, 3, 7)", json!(3)),
        ("str(x) + name", json!("10quill")),
        ("[i * 2 if x > 0 else i for: nope", json!(null)), // syntax error sentinel
    ];

    for (expr, expected) in table {
        if expected == json!(null) {
            assert!(engine.evaluate(expr, &context).is_err(), "{}", expr);
            continue;
        }
        let first = engine.evaluate(expr, &context).unwrap();
        let second = engine.evaluate(expr, &context).unwrap();
        assert_eq!(first, expected, "{}", expr);
        assert_eq!(first, second, "purity violated for {}", expr);
    }
}

#[test]
fn forbidden_tokens_always_raise_unsafe() {
    let engine = ExpressionEngine::default();
    let context = HashMap::new();
    for expr in [
        "x.__dict__",
        "import sys",
        "exec('pwn')",
        "eval('2')",
        "open('f')",
        "globals()",
        "locals()",
        "getattr(a, 'b')",
        "setattr(a, 'b', 1)",
        "file('x')",
        "input()",
    ] {
        let err = engine.evaluate(expr, &context).unwrap_err();
        assert_eq!(err.kind(), "UnsafeExpression", "{}", expr);
    }
}
