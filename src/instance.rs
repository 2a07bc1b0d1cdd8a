// A 'stack' of component instances specifying the position in the render
// tree.
//
// The stack is built up during server-side component creation to mirror the
// tree position the client runtime derives independently while instantiating
// the same tree. The two walks must agree byte for byte, so every operation
// here cross-checks its arguments and treats any mismatch as an
// unrecoverable bug: we panic rather than continue with a path the client
// would disagree about.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::{debug, trace};

/// Names a component definition: `namespace:name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Descriptor {
    namespace: String,
    name: String,
}

impl Descriptor {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Descriptor {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// A live component (or other addressable instance) participating in the
/// render. `path()` is the creation path assigned when the instance was
/// built, used when the stack re-roots at a parent for out-of-band
/// attribute writes.
pub trait Instance {
    fn path(&self) -> &str;
    fn descriptor(&self) -> &Descriptor;
}

/// A component eligible for the serialized registry.
pub trait Component: Instance {
    /// Whether this component carries server-provided state the client
    /// cannot rebuild on its own; only such components serialize.
    fn has_local_dependencies(&self) -> bool;

    fn to_json(&self) -> serde_json::Value;
}

/// Classifies namespaces into the trusted (internal) set. Replaces ambient
/// configuration: callers hand the stack an explicit policy at creation.
pub trait NamespaceRules {
    fn is_internal_namespace(&self, namespace: &str) -> bool;
}

/// Per-frame bookkeeping. The lifecycle of a frame is
/// open → name set → index set → children recurse → index cleared →
/// name cleared → pop, and every transition is checked.
struct Entry {
    instance: Option<Rc<dyn Instance>>,
    /// Path length (in segments) when this frame opened.
    start_len: usize,
    name: Option<String>,
    /// Path length just after the name segment was appended.
    name_len: usize,
    /// Reentrancy count for mark_parent on an already-current parent.
    count: u32,
    index: Option<u32>,
    top: bool,
    access_stack: Vec<Rc<dyn Instance>>,
}

impl Entry {
    fn new(instance: Option<Rc<dyn Instance>>, start_len: usize) -> Self {
        Entry {
            instance,
            start_len,
            name: None,
            name_len: 0,
            count: 0,
            index: None,
            top: false,
            access_stack: Vec::new(),
        }
    }

    fn access(&self) -> Option<Rc<dyn Instance>> {
        self.access_stack
            .last()
            .cloned()
            .or_else(|| self.instance.clone())
    }
}

fn same_instance(a: Option<&Rc<dyn Instance>>, b: &Rc<dyn Instance>) -> bool {
    match a {
        Some(a) => Rc::ptr_eq(a, b),
        None => false,
    }
}

/// Tree-position tracker for one in-flight render or action execution.
///
/// Owned exclusively by the thread driving that render; created at request
/// start, discarded at request end. The component-instantiation pipeline
/// pushes and pops around each instance it creates, and the final registry
/// is read out for response serialization.
pub struct InstanceStack {
    rules: Rc<dyn NamespaceRules>,
    component_registry: IndexMap<String, Rc<dyn Component>>,
    next_id: u32,
    /// Current position as path segments, joined on read.
    path: Vec<String>,
    stack: Vec<Entry>,
    current: Entry,
    /// Segments of the base path, restored when a marked parent clears.
    base: Vec<String>,
    top_external: Option<Rc<dyn Instance>>,
}

impl InstanceStack {
    pub fn new(rules: Rc<dyn NamespaceRules>) -> Self {
        let mut stack = InstanceStack {
            rules,
            component_registry: IndexMap::new(),
            next_id: 1,
            path: Vec::new(),
            stack: Vec::new(),
            current: Entry::new(None, 0),
            base: Vec::new(),
            top_external: None,
        };
        stack.set_attribute_name("body");
        stack.set_attribute_index(0);
        stack.current.top = true;
        stack.base = stack.path.clone();
        stack
    }

    /// Start processing a component.
    pub fn push_instance(&mut self, instance: Rc<dyn Instance>) {
        if self.top_external.is_none()
            && !self
                .rules
                .is_internal_namespace(instance.descriptor().namespace())
        {
            self.top_external = Some(instance.clone());
        }
        trace!("push {} at {}", instance.descriptor(), self.get_path());
        let opened = Entry::new(Some(instance), self.path.len());
        self.stack.push(std::mem::replace(&mut self.current, opened));
    }

    /// Finish processing a component. Must pair with the push that opened
    /// the current frame; at the stack base the attribute index advances so
    /// repeated top-level siblings get increasing indices.
    pub fn pop_instance(&mut self, instance: &Rc<dyn Instance>) {
        if !same_instance(self.current.instance.as_ref(), instance) {
            panic!("mismatched instance pop");
        }
        if same_instance(self.top_external.as_ref(), instance) {
            self.top_external = None;
        }
        self.current = self
            .stack
            .pop()
            .unwrap_or_else(|| panic!("mismatched instance pop"));
        if self.current.top {
            let index = match self.current.index {
                Some(index) => index,
                None => panic!("mismatched instance pop"),
            };
            self.clear_attribute_index(index);
            self.set_attribute_index(index + 1);
        }
    }

    /// Push an access entry onto the stack.
    ///
    /// This is orthogonal to the instance stack so that attribute sets can
    /// bounce 'up' the stack to assign access rights correctly.
    pub fn push_access(&mut self, instance: Rc<dyn Instance>) {
        self.current.access_stack.push(instance);
    }

    /// Pop an access entry off the stack. Must exactly correspond to the
    /// push.
    pub fn pop_access(&mut self, instance: &Rc<dyn Instance>) {
        match self.current.access_stack.pop() {
            Some(top) if Rc::ptr_eq(&top, instance) => {}
            _ => panic!("mismatched access pop"),
        }
    }

    /// Ensure that the expected parent is current.
    ///
    /// Used when an attribute is written outside the tree traversal: the
    /// path is re-rooted at the parent's own creation path. Re-marking the
    /// already-current parent only bumps a reentrancy counter.
    pub fn mark_parent(&mut self, parent: &Rc<dyn Instance>) {
        if !self.current.top {
            if !same_instance(self.current.instance.as_ref(), parent) {
                panic!("mismatched parent mark");
            }
            self.current.count += 1;
        } else {
            self.path.clear();
            self.path.push(parent.path().to_string());
            self.push_instance(parent.clone());
        }
    }

    /// Clear the parent previously marked.
    pub fn clear_parent(&mut self, parent: &Rc<dyn Instance>) {
        if !same_instance(self.current.instance.as_ref(), parent) {
            panic!("mismatched clear parent");
        }
        if self.current.count > 0 {
            self.current.count -= 1;
        } else {
            self.pop_instance(parent);
            self.path = self.base.clone();
        }
    }

    /// Set the name part on the current frame.
    ///
    /// A name is either an attribute name (e.g. body) or a predefined name.
    /// The name _must_ be cleared after setting it.
    pub fn set_attribute_name(&mut self, name: &str) {
        if self.current.name.is_some() || self.current.top {
            panic!("setting name illegally");
        }
        self.current.name = Some(name.to_string());
        let segment = match name {
            "body" => "/*".to_string(),
            "realbody" => "/+".to_string(),
            other => format!("/{}", other),
        };
        self.path.push(segment);
        self.current.name_len = self.path.len();
    }

    /// Pop a previously set name off the current frame.
    pub fn clear_attribute_name(&mut self, name: &str) {
        if self.current.name.as_deref() != Some(name) {
            panic!("mismatched clear_attribute_name for {}", name);
        }
        self.current.name = None;
        self.path.truncate(self.current.start_len);
    }

    /// Push an index onto the current frame. Indices attach to a name;
    /// there is no way to index anything else.
    pub fn set_attribute_index(&mut self, index: u32) {
        if self.current.name.is_none() {
            panic!("no name when index set");
        }
        if self.current.index.is_some() {
            panic!("missing clear_attribute_index");
        }
        self.current.index = Some(index);
        self.path.push(format!("[{}]", index));
    }

    /// Pop a previously pushed index off the current frame.
    pub fn clear_attribute_index(&mut self, index: u32) {
        if self.current.index != Some(index) {
            panic!("mismatched clear_attribute_index");
        }
        self.current.index = None;
        self.path.truncate(self.current.name_len);
    }

    /// The current path.
    pub fn get_path(&self) -> String {
        self.path.concat()
    }

    /// The instance on top of the stack.
    pub fn peek(&self) -> Option<Rc<dyn Instance>> {
        self.current.instance.clone()
    }

    /// The effective access context: the top of the current frame's access
    /// stack, falling back to the frame's own instance.
    pub fn get_access(&self) -> Option<Rc<dyn Instance>> {
        self.current.access()
    }

    /// True once an instance from outside the internal namespaces has been
    /// pushed and not yet popped.
    pub fn is_external(&self) -> bool {
        self.top_external.is_some()
    }

    /// Next id for a component. Only used for server-side rendering; these
    /// ids are never serialized to the client.
    pub fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Record path → component for later serialization.
    ///
    /// Only the render pipeline should call this; registration order is
    /// preserved. A re-registered path overwrites silently — attribute
    /// defaults can legitimately revisit a path.
    pub fn register_component(&mut self, component: Rc<dyn Component>) {
        debug!(
            "register {} at {}",
            component.descriptor(),
            component.path()
        );
        self.component_registry
            .insert(component.path().to_string(), component);
    }

    /// All components registered during this render, in registration order.
    pub fn components(&self) -> &IndexMap<String, Rc<dyn Component>> {
        &self.component_registry
    }

    /// Emit the registered components that carry local dependencies into
    /// `out` under the key `components`, sorted by path so output is
    /// reproducible for identical trees. Writes nothing when the filtered
    /// set is empty.
    pub fn serialize_as_part(&self, out: &mut serde_json::Map<String, serde_json::Value>) {
        if self.component_registry.is_empty() {
            return;
        }
        let mut sorted: Vec<&Rc<dyn Component>> = self
            .component_registry
            .values()
            .filter(|c| c.has_local_dependencies())
            .collect();
        if sorted.is_empty() {
            return;
        }
        sorted.sort_by(|a, b| a.path().cmp(b.path()));
        out.insert(
            "components".to_string(),
            serde_json::Value::Array(sorted.iter().map(|c| c.to_json()).collect()),
        );
    }

    /// Human-readable frames for diagnostics: the current frame first,
    /// then the enclosing frames outermost first.
    pub fn stack_info(&self) -> Vec<String> {
        let mut info = Vec::new();
        add_stack_info(&self.current, &mut info);
        for entry in &self.stack {
            add_stack_info(entry, &mut info);
        }
        info
    }
}

fn add_stack_info(entry: &Entry, info: &mut Vec<String>) {
    let Some(instance) = &entry.instance else {
        return;
    };
    let mut line = instance.descriptor().to_string();
    if let Some(name) = &entry.name {
        line.push('.');
        line.push_str(name);
        if let Some(index) = entry.index {
            line.push_str(&format!("[{}]", index));
        }
    }
    info.push(line);
}

impl fmt::Display for InstanceStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceStack(path={})", self.get_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AllInternal;
    impl NamespaceRules for AllInternal {
        fn is_internal_namespace(&self, _namespace: &str) -> bool {
            true
        }
    }

    struct Fake {
        path: String,
        descriptor: Descriptor,
    }

    impl Fake {
        fn new(path: &str, namespace: &str, name: &str) -> Rc<dyn Instance> {
            Rc::new(Fake {
                path: path.to_string(),
                descriptor: Descriptor::new(namespace, name),
            })
        }
    }

    impl Instance for Fake {
        fn path(&self) -> &str {
            &self.path
        }
        fn descriptor(&self) -> &Descriptor {
            &self.descriptor
        }
    }

    fn stack() -> InstanceStack {
        InstanceStack::new(Rc::new(AllInternal))
    }

    #[test]
    fn test_base_path() {
        assert_eq!(stack().get_path(), "/*[0]");
    }

    #[test]
    fn test_name_shorthands() {
        let mut s = stack();
        let c = Fake::new("/*[0]", "ui", "widget");
        s.push_instance(c.clone());

        s.set_attribute_name("body");
        assert_eq!(s.get_path(), "/*[0]/*");
        s.clear_attribute_name("body");

        s.set_attribute_name("realbody");
        assert_eq!(s.get_path(), "/*[0]/+");
        s.clear_attribute_name("realbody");

        s.set_attribute_name("header");
        s.set_attribute_index(2);
        assert_eq!(s.get_path(), "/*[0]/header[2]");
        s.clear_attribute_index(2);
        s.clear_attribute_name("header");

        s.pop_instance(&c);
    }

    #[test]
    fn test_top_level_siblings_advance_index() {
        let mut s = stack();
        for expected in ["/*[0]", "/*[1]", "/*[2]"] {
            assert_eq!(s.get_path(), expected);
            let c = Fake::new(expected, "ui", "widget");
            s.push_instance(c.clone());
            s.pop_instance(&c);
        }
        assert_eq!(s.get_path(), "/*[3]");
    }

    #[test]
    #[should_panic(expected = "mismatched instance pop")]
    fn test_mismatched_pop_panics() {
        let mut s = stack();
        let a = Fake::new("/*[0]", "ui", "a");
        let b = Fake::new("/*[0]", "ui", "b");
        s.push_instance(a);
        s.pop_instance(&b);
    }

    #[test]
    #[should_panic(expected = "setting name illegally")]
    fn test_setting_name_twice_panics() {
        let mut s = stack();
        let c = Fake::new("/*[0]", "ui", "widget");
        s.push_instance(c);
        s.set_attribute_name("a");
        s.set_attribute_name("b");
    }

    #[test]
    #[should_panic(expected = "no name when index set")]
    fn test_index_without_name_panics() {
        let mut s = stack();
        let c = Fake::new("/*[0]", "ui", "widget");
        s.push_instance(c);
        s.set_attribute_index(0);
    }

    #[test]
    fn test_access_stack_overrides() {
        let mut s = stack();
        let owner = Fake::new("/*[0]", "ui", "owner");
        let grantor = Fake::new("/*[0]", "ui", "grantor");
        s.push_instance(owner.clone());
        assert!(Rc::ptr_eq(&s.get_access().unwrap(), &owner));

        s.push_access(grantor.clone());
        assert!(Rc::ptr_eq(&s.get_access().unwrap(), &grantor));
        s.pop_access(&grantor);
        assert!(Rc::ptr_eq(&s.get_access().unwrap(), &owner));

        s.pop_instance(&owner);
    }

    #[test]
    #[should_panic(expected = "mismatched access pop")]
    fn test_mismatched_access_pop_panics() {
        let mut s = stack();
        let owner = Fake::new("/*[0]", "ui", "owner");
        let other = Fake::new("/*[0]", "ui", "other");
        s.push_instance(owner.clone());
        s.push_access(owner.clone());
        s.pop_access(&other);
    }

    #[test]
    fn test_external_tracking() {
        struct OnlyUi;
        impl NamespaceRules for OnlyUi {
            fn is_internal_namespace(&self, namespace: &str) -> bool {
                namespace == "ui"
            }
        }

        let mut s = InstanceStack::new(Rc::new(OnlyUi));
        let trusted = Fake::new("/*[0]", "ui", "inner");
        let foreign = Fake::new("/*[0]/*[0]", "acme", "thing");

        s.push_instance(trusted.clone());
        assert!(!s.is_external());
        s.push_instance(foreign.clone());
        assert!(s.is_external());
        s.pop_instance(&foreign);
        assert!(!s.is_external());
        s.pop_instance(&trusted);
    }

    #[test]
    fn test_next_id_is_monotonic() {
        let mut s = stack();
        assert_eq!(s.next_id(), 1);
        assert_eq!(s.next_id(), 2);
        assert_eq!(s.next_id(), 3);
    }

    #[test]
    fn test_stack_info() {
        let mut s = stack();
        let outer = Fake::new("/*[0]", "ui", "outer");
        let inner = Fake::new("/*[0]/row[1]", "ui", "inner");
        s.push_instance(outer.clone());
        s.set_attribute_name("row");
        s.set_attribute_index(1);
        s.push_instance(inner.clone());

        let info = s.stack_info();
        assert_eq!(info, vec!["ui:inner".to_string(), "ui:outer.row[1]".to_string()]);
    }

    #[test]
    fn test_display() {
        assert_eq!(stack().to_string(), "InstanceStack(path=/*[0])");
    }
}
