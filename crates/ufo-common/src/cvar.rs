// cvar.rs — named tunables shared by the worlds and the routing builder
//
// Latched variables only take their new value when the next map loads, so
// a running battle keeps routing with the values its grid was built with.

use bitflags::bitflags;
use log::{info, warn};
use std::collections::HashMap;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CvarFlags: u32 {
        /// Saved with the user configuration.
        const ARCHIVE = 1 << 0;
        /// Only settable by the engine.
        const NOSET = 1 << 3;
        /// Changes wait for the next map load.
        const LATCH = 1 << 4;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Cvar {
    pub string: String,
    pub value: f32,
    pub latched: Option<String>,
    pub flags: CvarFlags,
}

impl Cvar {
    fn new(string: &str, flags: CvarFlags) -> Self {
        Self {
            string: string.to_string(),
            value: parse_value(string),
            latched: None,
            flags,
        }
    }

    fn assign(&mut self, string: &str) {
        self.string = string.to_string();
        self.value = parse_value(string);
    }
}

fn parse_value(s: &str) -> f32 {
    s.trim().parse().unwrap_or(0.0)
}

#[derive(Default, Debug)]
pub struct CvarContext {
    vars: HashMap<String, Cvar>,
}

impl CvarContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a variable with its default. An existing variable keeps its
    /// value and gains the flags.
    pub fn register(&mut self, name: &str, default: &str, flags: CvarFlags) -> &Cvar {
        let var = self
            .vars
            .entry(name.to_string())
            .or_insert_with(|| Cvar::new(default, CvarFlags::empty()));
        var.flags |= flags;
        var
    }

    pub fn find(&self, name: &str) -> Option<&Cvar> {
        self.vars.get(name)
    }

    pub fn value(&self, name: &str) -> Option<f32> {
        self.vars.get(name).map(|v| v.value)
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|v| v.string.as_str())
    }

    /// Set from user input. Returns whether the live value changed.
    pub fn set(&mut self, name: &str, value: &str) -> bool {
        let Some(var) = self.vars.get_mut(name) else {
            self.vars.insert(name.to_string(), Cvar::new(value, CvarFlags::empty()));
            return true;
        };

        if var.flags.contains(CvarFlags::NOSET) {
            warn!("{} is write protected", name);
            return false;
        }
        if var.flags.contains(CvarFlags::LATCH) {
            if var.latched.as_deref().unwrap_or(&var.string) != value {
                info!("{} will be changed for next map", name);
                var.latched = Some(value.to_string());
            }
            return false;
        }
        if var.string == value {
            return false;
        }
        var.assign(value);
        true
    }

    /// Engine-side set: ignores NOSET and LATCH and drops a pending latch.
    pub fn force_set(&mut self, name: &str, value: &str) {
        match self.vars.get_mut(name) {
            Some(var) => {
                var.latched = None;
                var.assign(value);
            }
            None => {
                self.vars.insert(name.to_string(), Cvar::new(value, CvarFlags::empty()));
            }
        }
    }

    pub fn set_value(&mut self, name: &str, value: f32) -> bool {
        if value.fract() == 0.0 {
            self.set(name, &format!("{}", value as i64))
        } else {
            self.set(name, &value.to_string())
        }
    }

    /// Apply pending latched values. Returns how many changed.
    pub fn apply_latched(&mut self) -> usize {
        let mut changed = 0;
        for var in self.vars.values_mut() {
            if let Some(latched) = var.latched.take() {
                var.assign(&latched);
                changed += 1;
            }
        }
        changed
    }
}
