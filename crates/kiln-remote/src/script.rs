//! Ordered collections of remote shell scripts.

use std::sync::{Mutex, PoisonError};

/// Interpreter a script is run with
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Executor {
    /// `#!/bin/bash`
    #[default]
    Bash,
    /// `#!/bin/sh`
    Sh,
}

impl Executor {
    /// Interpreter directive line, including the trailing newline
    pub fn directive(&self) -> &'static str {
        match self {
            Executor::Bash => "#!/bin/bash\n",
            Executor::Sh => "#!/bin/sh\n",
        }
    }
}

/// One remote script
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Script {
    /// Name used in logs
    pub name: String,
    /// Interpreter
    pub executor: Executor,
    /// Whether a failed run is retried
    pub can_retry: bool,
    /// Attempts allowed when `can_retry` is set
    pub max_retries: u8,
    /// Script body
    pub body: String,
    /// Stdout reported for this script in fake runs
    pub fake_output: Option<String>,
}

impl Script {
    /// A bash script that is not retried
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executor: Executor::Bash,
            can_retry: false,
            max_retries: 0,
            body: body.into(),
            fake_output: None,
        }
    }

    /// Allow up to `max_retries` attempts
    pub fn with_retries(mut self, max_retries: u8) -> Self {
        self.can_retry = true;
        self.max_retries = max_retries;
        self
    }

    /// Canned stdout a fake run reports instead of the default
    pub fn with_fake_output(mut self, output: impl Into<String>) -> Self {
        self.fake_output = Some(output.into());
        self
    }

    /// Run with a different interpreter
    pub fn with_executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }
}

#[derive(Debug, Default)]
struct Inner {
    scripts: Vec<Script>,
    next: usize,
}

/// Append-only script sequence consumed front to back.
///
/// Appending is safe from several tasks; a built collection is moved into
/// exactly one execution.
#[derive(Debug, Default)]
pub struct ScriptCollection {
    inner: Mutex<Inner>,
}

impl ScriptCollection {
    /// Empty collection
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a script, prefixing its body with the interpreter directive
    pub fn append(&self, mut script: Script) {
        script.body = format!("{}{}", script.executor.directive(), script.body);
        self.lock().scripts.push(script);
    }

    /// Consume the next script
    pub fn next_script(&self) -> Option<Script> {
        let mut inner = self.lock();
        let script = inner.scripts.get(inner.next).cloned()?;
        inner.next += 1;
        Some(script)
    }

    /// No scripts are left to consume (an empty collection is exhausted)
    pub fn is_completed(&self) -> bool {
        let inner = self.lock();
        inner.next >= inner.scripts.len()
    }

    /// Number of scripts appended
    pub fn len(&self) -> usize {
        self.lock().scripts.len()
    }

    /// No scripts appended
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of every appended script, in order
    pub fn names(&self) -> Vec<String> {
        self.lock().scripts.iter().map(|s| s.name.clone()).collect()
    }
}

impl FromIterator<Script> for ScriptCollection {
    fn from_iter<I: IntoIterator<Item = Script>>(iter: I) -> Self {
        let collection = ScriptCollection::new();
        for script in iter {
            collection.append(script);
        }
        collection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn append_then_consume_exhausts_collection() {
        let c = ScriptCollection::new();
        let bodies = ["echo one", "echo two", "echo three"];
        for (i, body) in bodies.iter().enumerate() {
            let executor = if i == 1 { Executor::Sh } else { Executor::Bash };
            c.append(Script::new(format!("s{}", i), *body).with_executor(executor));
        }
        assert_eq!(c.len(), 3);
        assert!(!c.is_completed());

        let first = c.next_script().unwrap();
        assert_eq!(first.body, "#!/bin/bash\necho one");
        let second = c.next_script().unwrap();
        assert_eq!(second.body, "#!/bin/sh\necho two");
        let third = c.next_script().unwrap();
        assert_eq!(third.body, "#!/bin/bash\necho three");

        assert!(c.is_completed());
        assert!(c.next_script().is_none());
    }

    #[test]
    fn empty_collection_is_completed() {
        let c = ScriptCollection::new();
        assert!(c.is_completed());
        assert!(c.next_script().is_none());
    }

    #[test]
    fn retry_settings_are_kept() {
        let c: ScriptCollection = [Script::new("install", "apt-get install -y etcd").with_retries(9)]
            .into_iter()
            .collect();
        let s = c.next_script().unwrap();
        assert!(s.can_retry);
        assert_eq!(s.max_retries, 9);
    }

    #[test]
    fn concurrent_appends_are_all_kept() {
        let c = Arc::new(ScriptCollection::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let c = c.clone();
                std::thread::spawn(move || c.append(Script::new(format!("s{}", i), "true")))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.len(), 8);
    }
}
