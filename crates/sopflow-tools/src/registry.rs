use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use sopflow_core::error::{Result, SopError};
use sopflow_core::sop::ToolRef;
use sopflow_core::traits::{Reasoner, Tool};
use sopflow_core::types::{ParamSpec, ToolContext};

use crate::output::parse_structured_output;
use crate::signature::validate_args;

/// Category under which reasoners appear in the catalog.
const AGENT_CATEGORY: &str = "agents";

#[derive(Clone)]
enum Handle {
    Static(Arc<dyn Tool>),
    Dynamic {
        reasoner: Arc<dyn Reasoner>,
        directive: String,
    },
}

/// Everything the engine needs to call one resolved `tool_ref`.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub category: String,
    /// Empty for dynamic tools, which accept any arguments.
    pub signature: Vec<ParamSpec>,
    pub timeout_secs: Option<u64>,
    handle: Handle,
}

impl ToolDescriptor {
    pub fn is_dynamic(&self) -> bool {
        matches!(self.handle, Handle::Dynamic { .. })
    }

    /// Call the tool once. Static arguments are validated against the
    /// signature first; dynamic output is parsed into JSON.
    pub fn invoke(&self, args: Map<String, Value>, ctx: ToolContext) -> BoxFuture<'static, Result<Value>> {
        let name = self.name.clone();
        let signature = self.signature.clone();
        let handle = self.handle.clone();
        Box::pin(async move {
            match handle {
                Handle::Static(tool) => {
                    let args = validate_args(&name, &signature, args)?;
                    tool.execute(args, ctx).await
                }
                Handle::Dynamic {
                    reasoner,
                    directive,
                } => {
                    let text = reasoner.reason(directive, args, ctx).await?;
                    parse_structured_output(&text).map_err(|message| SopError::OutputParse {
                        agent: name,
                        message,
                    })
                }
            }
        })
    }
}

/// Registry of static tools and reasoners, built once at startup.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    reasoners: HashMap<String, Arc<dyn Reasoner>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            reasoners: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Register a reasoner usable as a dynamic tool.
    pub fn register_reasoner(&mut self, reasoner: impl Reasoner) {
        self.register_reasoner_arc(Arc::new(reasoner));
    }

    pub fn register_reasoner_arc(&mut self, reasoner: Arc<dyn Reasoner>) {
        self.reasoners.insert(reasoner.name().to_string(), reasoner);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Get a reasoner by name.
    pub fn get_reasoner(&self, name: &str) -> Option<Arc<dyn Reasoner>> {
        self.reasoners.get(name).cloned()
    }

    /// Whether the target of `tool_ref` is registered.
    pub fn contains(&self, tool_ref: &ToolRef) -> bool {
        match tool_ref {
            ToolRef::Static { name } => self.tools.contains_key(name),
            ToolRef::Dynamic { agent, .. } => self.reasoners.contains_key(agent),
        }
    }

    /// List all registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Resolve a `tool_ref` to a callable descriptor.
    pub fn lookup(&self, tool_ref: &ToolRef) -> Result<ToolDescriptor> {
        match tool_ref {
            ToolRef::Static { name } => {
                let tool = self
                    .get(name)
                    .ok_or_else(|| SopError::ToolNotFound(name.clone()))?;
                Ok(Self::describe_tool(tool))
            }
            ToolRef::Dynamic { agent, directive } => {
                let reasoner = self
                    .get_reasoner(agent)
                    .ok_or_else(|| SopError::ToolNotFound(format!("agent:{}", agent)))?;
                Ok(ToolDescriptor {
                    name: reasoner.name().to_string(),
                    description: reasoner.description().to_string(),
                    category: AGENT_CATEGORY.to_string(),
                    signature: Vec::new(),
                    timeout_secs: reasoner.timeout_secs(),
                    handle: Handle::Dynamic {
                        reasoner,
                        directive: directive.clone(),
                    },
                })
            }
        }
    }

    fn describe_tool(tool: Arc<dyn Tool>) -> ToolDescriptor {
        ToolDescriptor {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            category: tool.category().to_string(),
            signature: tool.signature(),
            timeout_secs: tool.timeout_secs(),
            handle: Handle::Static(tool),
        }
    }

    /// Descriptors of all static tools, sorted by name.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> = self
            .tools
            .values()
            .cloned()
            .map(Self::describe_tool)
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Render the catalog handed to upstream SOP generation, grouped by
    /// category:
    ///
    /// ```text
    /// [math]
    /// - add(a: number, b: number) -> Add two numbers.
    /// ```
    pub fn catalog(&self) -> String {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for d in self.descriptors() {
            let params: Vec<String> = d
                .signature
                .iter()
                .map(|p| {
                    let marker = if p.required { "" } else { "?" };
                    format!("{}{}: {}", p.name, marker, p.ty)
                })
                .collect();
            groups.entry(d.category).or_default().push(format!(
                "- {}({}) -> {}",
                d.name,
                params.join(", "),
                d.description
            ));
        }

        let mut agents: Vec<&Arc<dyn Reasoner>> = self.reasoners.values().collect();
        agents.sort_by(|a, b| a.name().cmp(b.name()));
        for r in agents {
            groups
                .entry(AGENT_CATEGORY.to_string())
                .or_default()
                .push(format!("- {}: {}", r.name(), r.description()));
        }

        let mut out = String::new();
        for (group, lines) in groups {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("[{}]\n", group));
            for line in lines {
                out.push_str(&line);
                out.push('\n');
            }
        }
        out
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        // ── Math (8) ────────────────────────────────────────────
        for tool in crate::builtin::math::binary_tools() {
            registry.register(tool);
        }
        for tool in crate::builtin::math::unary_tools() {
            registry.register(tool);
        }

        // ── File (8) ────────────────────────────────────────────
        registry.register(crate::builtin::file::CreateFileTool);
        registry.register(crate::builtin::file::ReadFileTool);
        registry.register(crate::builtin::file::EditFileTool);
        registry.register(crate::builtin::file::DeleteFileTool);
        registry.register(crate::builtin::file::RenameFileTool);
        registry.register(crate::builtin::file::CopyFileTool);
        registry.register(crate::builtin::file::FileInfoTool);
        registry.register(crate::builtin::file::CheckFileExistsTool);

        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
