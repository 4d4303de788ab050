//! Client-side variable binding
//!
//! The table of variables a client process tunes. Each entry keeps the live
//! value the application reads and a shadow slot where values from the server
//! wait until the application pulls them.

use std::collections::HashMap;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{check_string, CodecError, LengthField, VarDef, VarKind, VarValue};

/// Binding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Variable already bound: {0}")]
    DuplicateVariable(String),

    #[error("Variable {name:?} is {expected}, got {found}")]
    TypeMismatch {
        name: String,
        expected: VarKind,
        found: VarKind,
    },

    #[error("Invalid variable: {0}")]
    Invalid(#[from] CodecError),
}

pub type BindingResult<T> = Result<T, BindingError>;

/// How a client brings server values into its live variables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PullMode {
    /// Send VAR_REQ and apply the reply
    #[default]
    Request,
    /// Apply values the server already pushed into the shadow slots
    Signal,
}

/// Position of a bound variable in its table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarHandle(usize);

/// Ordered set of locally bound variables
#[derive(Debug, Default)]
pub struct VariableTable {
    vars: Vec<VarDef>,
    index: HashMap<String, usize>,
}

impl VariableTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a new variable starting at the zero value of `kind`
    pub fn bind(&mut self, name: &str, kind: VarKind) -> BindingResult<VarHandle> {
        self.bind_value(name, kind.default_value())
    }

    /// Bind a new variable with an initial value
    pub fn bind_value(&mut self, name: &str, initial: VarValue) -> BindingResult<VarHandle> {
        if self.index.contains_key(name) {
            return Err(BindingError::DuplicateVariable(name.to_string()));
        }
        let var = VarDef::new(name, initial);
        var.validate()?;

        let handle = VarHandle(self.vars.len());
        self.index.insert(name.to_string(), handle.0);
        self.vars.push(var);
        Ok(handle)
    }

    /// Drop the most recent binding, used when the server refuses it
    pub fn unbind_last(&mut self) -> Option<VarDef> {
        let var = self.vars.pop()?;
        self.index.remove(&var.name);
        Some(var)
    }

    pub fn handle(&self, name: &str) -> BindingResult<VarHandle> {
        self.index
            .get(name)
            .map(|&i| VarHandle(i))
            .ok_or_else(|| BindingError::UnknownVariable(name.to_string()))
    }

    pub fn get(&self, handle: VarHandle) -> BindingResult<&VarDef> {
        self.vars
            .get(handle.0)
            .ok_or_else(|| BindingError::UnknownVariable(format!("#{}", handle.0)))
    }

    pub fn by_name(&self, name: &str) -> BindingResult<&VarDef> {
        self.get(self.handle(name)?)
    }

    /// Live value of a variable
    pub fn value(&self, handle: VarHandle) -> BindingResult<&VarValue> {
        self.get(handle).map(|v| &v.value)
    }

    /// Change the live value; the shadow is left alone
    pub fn set(&mut self, handle: VarHandle, value: VarValue) -> BindingResult<()> {
        let var = self.slot(handle, &value)?;
        var.value = value;
        Ok(())
    }

    /// Stage values from the server into the shadow slots
    pub fn stage_all(&mut self, updates: &[VarDef]) -> BindingResult<usize> {
        self.apply(updates, |var, value| var.shadow = value)
    }

    /// Write values from the server straight into the live slots
    pub fn apply_all(&mut self, updates: &[VarDef]) -> BindingResult<usize> {
        self.apply(updates, |var, value| {
            var.shadow = value.clone();
            var.value = value;
        })
    }

    /// Copy every shadow into its live value
    pub fn pull_all(&mut self) {
        self.vars.iter_mut().for_each(VarDef::pull);
    }

    /// Live values of every variable, in binding order
    pub fn snapshot(&self) -> Vec<VarDef> {
        self.vars
            .iter()
            .map(|v| VarDef::new(v.name.clone(), v.value.clone()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VarDef> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    fn slot(&mut self, handle: VarHandle, value: &VarValue) -> BindingResult<&mut VarDef> {
        self.get(handle)?;
        let var = &mut self.vars[handle.0];
        check_kind(var, value)?;
        if let VarValue::String(s) = value {
            check_string(s, LengthField::U32)?;
        }
        Ok(var)
    }

    /// All names and kinds are checked before anything is written
    fn apply<F>(&mut self, updates: &[VarDef], mut write: F) -> BindingResult<usize>
    where
        F: FnMut(&mut VarDef, VarValue),
    {
        let mut targets = Vec::with_capacity(updates.len());
        for update in updates {
            let i = self.handle(&update.name)?.0;
            check_kind(&self.vars[i], &update.value)?;
            targets.push(i);
        }
        for (i, update) in targets.into_iter().zip(updates) {
            write(&mut self.vars[i], update.value.clone());
        }
        Ok(updates.len())
    }
}

fn check_kind(var: &VarDef, value: &VarValue) -> BindingResult<()> {
    if var.kind() != value.kind() {
        return Err(BindingError::TypeMismatch {
            name: var.name.clone(),
            expected: var.kind(),
            found: value.kind(),
        });
    }
    Ok(())
}
