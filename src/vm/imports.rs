//! Module loading: file-id allocation, stub installation, and the
//! memoized import cache.

use std::rc::Rc;

use crate::bytecode::{decode_program, Stub};
use crate::error::{LoadError, RuntimeFault};
use crate::store::Value;

use super::vm::Vm;

impl Vm {
    /// The file id for a module name, allocating one on first sight.
    /// Ids start at 1; 0 is reserved for native stubs.
    pub fn file_id_for_name(&mut self, name: &str) -> u32 {
        if let Some(id) = self.files.get(name) {
            return *id;
        }
        let id = (self.file_names.len() + 1) as u32;
        self.file_names.push(name.into());
        self.files.insert(name.into(), id);
        id
    }

    pub fn file_name(&self, id: u32) -> Option<&str> {
        if id == 0 {
            return None;
        }
        self.file_names.get(id as usize - 1).map(|n| n.as_ref())
    }

    /// Install decoded stubs under a file id, interning each stub's
    /// string pool. Pool values are created with a reference, so they
    /// outlive any collection for as long as the engine holds the stub.
    pub fn install_program(&mut self, file_id: u32, stubs: Vec<Stub>) {
        for mut stub in stubs {
            stub.file_id = file_id;
            let key = (file_id, stub.stub_id);
            let pool: Vec<Value> = stub
                .strings
                .iter()
                .map(|text| self.store.create_string(text))
                .collect();
            self.stub_strings.insert(key, Rc::new(pool));
            self.stubs.insert(key, Rc::new(stub));
        }
    }

    /// Decode, install, and execute a program's root stub under `name`,
    /// memoizing the result. Running a name twice returns the cached
    /// value without re-execution. Decode failures surface as errors
    /// rather than running a degenerate program.
    pub fn run(&mut self, name: &str, bytes: &[u8]) -> Result<Value, LoadError> {
        let file_id = self.file_id_for_name(name);
        if let Some(value) = self.imports.get(&file_id) {
            return Ok(*value);
        }
        let stubs = decode_program(bytes, file_id)?;
        self.install_program(file_id, stubs);
        Ok(self.execute_root(file_id))
    }

    /// Resolve a module by name through the registered importer. Cached
    /// results short-circuit; failures raise an import catchable.
    pub fn import(&mut self, name: &str) -> Value {
        let file_id = self.file_id_for_name(name);
        if let Some(value) = self.imports.get(&file_id) {
            return *value;
        }
        let Some(importer) = self.importer.clone() else {
            self.raise_fault(RuntimeFault::import(name, "no importer registered"));
            return Value::Empty;
        };
        let Some(bytes) = importer(self, name) else {
            self.raise_fault(RuntimeFault::import(name, "module not found"));
            return Value::Empty;
        };
        match decode_program(&bytes, file_id) {
            Ok(stubs) => {
                self.install_program(file_id, stubs);
                self.execute_root(file_id)
            }
            Err(err) => {
                self.raise_fault(RuntimeFault::import(name, err.to_string()));
                Value::Empty
            }
        }
    }

    fn execute_root(&mut self, file_id: u32) -> Value {
        let function = match self.stubs.get(&(file_id, 0)).cloned() {
            Some(stub) => self.store.create_function(stub),
            None => {
                self.raise_fault(RuntimeFault::unknown_stub(file_id, 0));
                if self.call_nesting == 0 {
                    self.flush_unhandled();
                }
                return Value::Empty;
            }
        };
        let result = self.call_with_values(function, &[], Value::Empty);
        self.imports.insert(file_id, result);
        result
    }
}
