use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rhai::{Dynamic, Engine, EvalAltResult, Map, Scope, AST};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use courier_core::{Error, Event, Matcher, Result};

use crate::context::SkillContext;
use crate::skill::{Handler, Skill};

const MAX_OPERATIONS: u64 = 100_000;
const SCRIPT_DEADLINE: Duration = Duration::from_secs(30);

/// Load a scripted skill from a `.rhai` file.
///
/// The script declares matchers in a top-level `matchers` array of
/// `#{type: "...", ...}` maps and handles events in `fn handle(event)`.
/// Host functions available to the handler: `respond(text)`,
/// `respond_to(connector, text)`, `recall(key)`, `remember(key, value)`,
/// `forget(key)`, `config()`, `log(msg)`, `log_warn(msg)`, `timestamp()`.
/// Compile failures, a missing handler and an empty matcher list all reject
/// the skill at load time.
pub fn load_script_skill(name: &str, path: &Path, config: Value) -> Result<Skill> {
    let script = std::fs::read_to_string(path)
        .map_err(|e| Error::Skill(format!("Failed to read {}: {}", path.display(), e)))?;

    let engine = sandboxed_engine();
    let ast = engine
        .compile(&script)
        .map_err(|e| Error::Skill(format!("{}: compilation error: {}", path.display(), e)))?;

    if !ast
        .iter_functions()
        .any(|f| f.name == "handle" && f.params.len() == 1)
    {
        return Err(Error::Skill(format!(
            "{}: script defines no handle(event) function",
            path.display()
        )));
    }

    let matchers = extract_matchers(&engine, &ast, path)?;
    if matchers.is_empty() {
        return Err(Error::Skill(format!(
            "{}: script declares no matchers",
            path.display()
        )));
    }

    info!(
        skill = %name,
        path = %path.display(),
        matchers = matchers.len(),
        "Loaded scripted skill"
    );

    Ok(Skill::builder(name)
        .matchers(matchers)
        .config(config)
        .handler(Arc::new(ScriptHandler { ast: Arc::new(ast) }))
        .build())
}

/// Run the top-level statements once and pull the `matchers` array out of
/// the scope. Host functions are not registered here, so a script that does
/// real work at the top level fails the load.
fn extract_matchers(engine: &Engine, ast: &AST, path: &Path) -> Result<Vec<Matcher>> {
    let mut scope = Scope::new();
    engine
        .run_ast_with_scope(&mut scope, ast)
        .map_err(|e| Error::Skill(format!("{}: {}", path.display(), e)))?;

    let declared = match scope.get_value::<rhai::Array>("matchers") {
        Some(arr) => arr,
        None => return Ok(Vec::new()),
    };

    let mut matchers = Vec::with_capacity(declared.len());
    for (i, entry) in declared.iter().enumerate() {
        let matcher = serde_json::from_value::<Matcher>(dynamic_to_json(entry)).map_err(|e| {
            Error::Skill(format!("{}: matcher {} is invalid: {}", path.display(), i, e))
        })?;
        matchers.push(matcher);
    }
    Ok(matchers)
}

struct ScriptHandler {
    ast: Arc<AST>,
}

#[async_trait]
impl Handler for ScriptHandler {
    async fn call(&self, ctx: SkillContext, event: Event) -> Result<()> {
        let ast = self.ast.clone();
        tokio::task::spawn_blocking(move || run_handle(&ast, ctx, event))
            .await
            .map_err(|e| Error::Skill(format!("Script task failed to join: {}", e)))?
    }
}

fn run_handle(ast: &AST, ctx: SkillContext, event: Event) -> Result<()> {
    let skill = ctx.skill_name().to_string();
    let engine = host_engine(&ctx, &event);
    let started = Instant::now();

    let mut scope = Scope::new();
    let result = engine.call_fn::<Dynamic>(&mut scope, ast, "handle", (event_to_map(&event),));

    debug!(
        skill = %skill,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Script handler finished"
    );

    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            if let EvalAltResult::ErrorTerminated(ref reason, _) = *e {
                return Err(Error::Skill(format!("Script terminated: {}", reason)));
            }
            Err(Error::Skill(format!("Script error: {}", e)))
        }
    }
}

fn sandboxed_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_string_size(1_000_000);
    engine.set_max_array_size(10_000);
    engine.set_max_map_size(10_000);
    engine.set_max_call_levels(64);
    engine.set_max_expr_depths(64, 64);
    engine
}

/// Sandboxed engine with the skill-facing host functions registered and a
/// progress guard so runaway scripts terminate instead of wedging a blocking
/// thread.
fn host_engine(ctx: &SkillContext, source: &Event) -> Engine {
    let mut engine = sandboxed_engine();

    let ops = Arc::new(AtomicU64::new(0));
    let started = Instant::now();
    engine.on_progress(move |_| {
        let count = ops.fetch_add(1, Ordering::Relaxed);
        if count >= MAX_OPERATIONS {
            return Some(Dynamic::from(format!(
                "Operation limit exceeded: {} operations",
                MAX_OPERATIONS
            )));
        }
        if started.elapsed() > SCRIPT_DEADLINE {
            return Some(Dynamic::from(format!(
                "Timeout exceeded: {} seconds",
                SCRIPT_DEADLINE.as_secs()
            )));
        }
        None
    });

    {
        let ctx = ctx.clone();
        let source = source.clone();
        engine.register_fn("respond", move |text: String| -> bool {
            let ctx = ctx.clone();
            let outbound = source.response(&text);
            block_on_host(async move { ctx.respond(outbound).await }).unwrap_or(false)
        });
    }

    {
        let ctx = ctx.clone();
        let source = source.clone();
        engine.register_fn("respond_to", move |connector: String, text: String| -> bool {
            let ctx = ctx.clone();
            let mut outbound = source.response(&text);
            outbound.connector = connector;
            block_on_host(async move { ctx.respond(outbound).await }).unwrap_or(false)
        });
    }

    {
        let ctx = ctx.clone();
        engine.register_fn("recall", move |key: String| -> Dynamic {
            let ctx = ctx.clone();
            match block_on_host(async move { ctx.memory().get(&key).await }) {
                Some(Some(value)) => json_to_dynamic(&value),
                _ => Dynamic::UNIT,
            }
        });
    }

    {
        let ctx = ctx.clone();
        engine.register_fn("remember", move |key: String, value: Dynamic| {
            let ctx = ctx.clone();
            let json = dynamic_to_json(&value);
            block_on_host(async move { ctx.memory().put(&key, json).await });
        });
    }

    {
        let ctx = ctx.clone();
        engine.register_fn("forget", move |key: String| {
            let ctx = ctx.clone();
            block_on_host(async move { ctx.memory().delete(&key).await });
        });
    }

    {
        let config = json_to_dynamic(ctx.config());
        engine.register_fn("config", move || -> Dynamic { config.clone() });
    }

    {
        let skill = ctx.skill_name().to_string();
        engine.register_fn("log", move |msg: String| {
            info!(skill = %skill, "{}", msg);
        });
    }

    {
        let skill = ctx.skill_name().to_string();
        engine.register_fn("log_warn", move |msg: String| {
            warn!(skill = %skill, "{}", msg);
        });
    }

    engine.register_fn("timestamp", || -> i64 { chrono::Utc::now().timestamp() });

    engine
}

/// Scripts run on the blocking pool; host calls hop back onto the runtime
/// from a scoped thread. None when no runtime is reachable.
fn block_on_host<T, Fut>(fut: Fut) -> Option<T>
where
    T: Send,
    Fut: Future<Output = T> + Send,
{
    let handle = match Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => return None,
    };
    std::thread::scope(|s| s.spawn(|| handle.block_on(fut)).join().ok())
}

fn event_to_map(event: &Event) -> Map {
    let mut map = Map::new();
    map.insert("id".into(), Dynamic::from(event.id.to_string()));
    map.insert("connector".into(), Dynamic::from(event.connector.clone()));
    map.insert("target".into(), Dynamic::from(event.target.clone()));
    map.insert("user".into(), Dynamic::from(event.user.clone()));
    map.insert("user_id".into(), Dynamic::from(event.user_id.clone()));
    map.insert("kind".into(), Dynamic::from(event.kind().as_str().to_string()));
    map.insert(
        "text".into(),
        match event.text() {
            Some(text) => Dynamic::from(text.to_string()),
            None => Dynamic::UNIT,
        },
    );
    map.insert("created".into(), Dynamic::from(event.created.timestamp()));
    let mut entities = Map::new();
    for (key, value) in &event.entities {
        entities.insert(key.as_str().into(), json_to_dynamic(value));
    }
    map.insert("entities".into(), Dynamic::from(entities));
    map.insert("raw".into(), json_to_dynamic(&event.raw));
    map
}

fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::from(n.to_string())
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => {
            let array: rhai::Array = items.iter().map(json_to_dynamic).collect();
            Dynamic::from(array)
        }
        Value::Object(fields) => {
            let mut map = Map::new();
            for (k, v) in fields {
                map.insert(k.as_str().into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

fn dynamic_to_json(value: &Dynamic) -> Value {
    if value.is_unit() {
        Value::Null
    } else if let Ok(b) = value.as_bool() {
        Value::Bool(b)
    } else if let Ok(i) = value.as_int() {
        Value::Number(i.into())
    } else if let Ok(f) = value.as_float() {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if value.is_string() {
        Value::String(value.clone().into_string().unwrap_or_default())
    } else if value.is_array() {
        let items = value.clone().into_array().unwrap_or_default();
        Value::Array(items.iter().map(dynamic_to_json).collect())
    } else if value.is_map() {
        match value.clone().try_cast::<Map>() {
            Some(map) => {
                let mut obj = serde_json::Map::new();
                for (k, v) in map {
                    obj.insert(k.to_string(), dynamic_to_json(&v));
                }
                Value::Object(obj)
            }
            None => Value::String(value.to_string()),
        }
    } else {
        Value::String(value.to_string())
    }
}
