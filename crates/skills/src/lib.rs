pub mod context;
pub mod registry;
pub mod script;
pub mod skill;

pub use context::{OutboundPort, SkillContext};
pub use registry::SkillRegistry;
pub use script::load_script_skill;
pub use skill::{FieldKind, FieldSpec, FnHandler, FnHook, Handler, Hook, Skill, SkillBuilder};
