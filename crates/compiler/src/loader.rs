//! File-Based Script Loader
//!
//! Resolves `import`/`use` names against a directory and compiles the file
//! on first use. Install as the heap's load callback; resolution is
//! idempotent because compilation registers the script under its name.

use crate::parser::compile_source;
use fixscript_runtime::Heap;
use std::path::PathBuf;
use std::rc::Rc;

pub struct FileLoader {
    root: PathBuf,
}

impl FileLoader {
    pub fn new(root: impl Into<PathBuf>) -> FileLoader {
        FileLoader { root: root.into() }
    }

    /// Install this loader as the heap's `LoadScriptFn`.
    pub fn install(self, heap: &mut Heap) {
        let root = self.root;
        heap.set_load_fn(Rc::new(move |heap, name| {
            let path = root.join(name);
            let source = std::fs::read_to_string(&path)
                .map_err(|e| format!("{}: {}", path.display(), e))?;
            compile_source(heap, name, &source).map_err(|e| e.to_string())
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_loads_and_compiles_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("util.fix");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "function double(x) {{ return x * 2; }}").unwrap();
        drop(f);

        let mut heap = Heap::new();
        FileLoader::new(dir.path()).install(&mut heap);
        let id = heap.load_script("util.fix").unwrap();
        assert!(heap.script(id).functions.contains_key("double#1"));
        // idempotent
        assert_eq!(heap.load_script("util.fix").unwrap(), id);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut heap = Heap::new();
        FileLoader::new(dir.path()).install(&mut heap);
        let err = heap.load_script("absent.fix").unwrap_err();
        assert!(err.contains("absent.fix"), "{}", err);
    }
}
