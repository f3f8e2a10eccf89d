use std::fmt;

use crate::error::Error;
use crate::handler::Handler;
use crate::middleware::{self, Middleware};

/// Ordered middleware around a terminal handler.
///
/// Entries are kept in execution order: index 0 is the outermost layer and
/// sees a request first. [`push`](Self::push) adds an innermost layer,
/// [`unshift`](Self::unshift) an outermost one.
#[derive(Clone, Default)]
pub struct HandlerStack {
    handler: Option<Handler>,
    stack: Vec<(Middleware, String)>,
}

impl HandlerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(handler: Handler) -> Self {
        Self {
            handler: Some(handler),
            stack: Vec::new(),
        }
    }

    /// Stack with the default middleware: `http_errors`, `allow_redirects`,
    /// `cookies`, `prepare_body`, outermost first.
    pub fn create(handler: Handler) -> Self {
        let mut stack = Self::with_handler(handler);
        stack.push(middleware::http_errors(), "http_errors");
        stack.push(middleware::redirect(), "allow_redirects");
        stack.push(middleware::cookies(), "cookies");
        stack.push(middleware::prepare_body(), "prepare_body");
        stack
    }

    pub fn set_handler(&mut self, handler: Handler) {
        self.handler = Some(handler);
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stack.iter().map(|(_, name)| name.as_str())
    }

    pub fn push(&mut self, middleware: Middleware, name: impl Into<String>) {
        self.stack.push((middleware, name.into()));
    }

    pub fn unshift(&mut self, middleware: Middleware, name: impl Into<String>) {
        self.stack.insert(0, (middleware, name.into()));
    }

    /// Inserts `middleware` so it runs just before `find_name`.
    pub fn before(
        &mut self,
        find_name: &str,
        middleware: Middleware,
        name: impl Into<String>,
    ) -> Result<(), Error> {
        let index = self.find_by_name(find_name)?;
        self.stack.insert(index, (middleware, name.into()));
        Ok(())
    }

    /// Inserts `middleware` so it runs just after `find_name`.
    pub fn after(
        &mut self,
        find_name: &str,
        middleware: Middleware,
        name: impl Into<String>,
    ) -> Result<(), Error> {
        let index = self.find_by_name(find_name)?;
        self.stack.insert(index + 1, (middleware, name.into()));
        Ok(())
    }

    /// Drops every entry registered under `name`.
    pub fn remove(&mut self, name: &str) {
        self.stack.retain(|(_, entry)| entry != name);
    }

    /// Drops every entry holding this exact middleware instance.
    pub fn remove_middleware(&mut self, middleware: &Middleware) {
        self.stack.retain(|(entry, _)| !entry.ptr_eq(middleware));
    }

    pub fn resolve(&self) -> Result<Handler, Error> {
        let Some(handler) = self.handler.clone() else {
            return Err(Error::MissingHandler);
        };
        Ok(self
            .stack
            .iter()
            .rev()
            .fold(handler, |next, (middleware, _)| middleware.wrap(next)))
    }

    fn find_by_name(&self, name: &str) -> Result<usize, Error> {
        self.stack
            .iter()
            .position(|(_, entry)| entry == name)
            .ok_or_else(|| Error::MiddlewareNotFound {
                name: name.to_owned(),
            })
    }
}

/// Dumps the request path (`>`) down to the handler and the response path
/// (`<`) back out. Numbers count layers from the handler.
impl fmt::Display for HandlerStack {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let depth = self.stack.len();
        for (offset, (_, name)) in self.stack.iter().enumerate() {
            writeln!(formatter, "> {}) Name: '{name}'", depth - offset)?;
        }
        let handler = if self.handler.is_some() {
            "set"
        } else {
            "missing"
        };
        writeln!(formatter, "< 0) Handler: {handler}")?;
        for (offset, (_, name)) in self.stack.iter().enumerate().rev() {
            writeln!(formatter, "< {}) Name: '{name}'", depth - offset)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HandlerStack {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("HandlerStack")
            .field("handler", &self.handler.is_some())
            .field("stack", &self.names().collect::<Vec<_>>())
            .finish()
    }
}
