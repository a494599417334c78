//! Turns inbound task descriptors into engine tasks.
//!
//! A descriptor addresses providers either through comma-separated role
//! flags or an explicit `providerKey`, and produces one task per provider.
//! Mode flags ride along as role suffixes on the provider's prefix:
//! `<prefix>-sdsk` enables deep thinking and `<prefix>-lwss` web search.

use cube_protocol::{DEFAULT_RESULT_TYPE, TaskDescriptor};
use cube_runtime::{DEEP_THINKING, Task, TaskId, WEB_SEARCH};
use tracing::{debug, warn};

use crate::error::{CubeError, Result};

const DEEP_THINKING_SUFFIX: &str = "-sdsk";
const WEB_SEARCH_SUFFIX: &str = "-lwss";

/// One addressable provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderRoute {
	/// Role flag selecting the provider.
	pub role: &'static str,
	pub provider: &'static str,
	pub ai_name: &'static str,
	/// Prefix of this provider's mode flags.
	pub mode_prefix: &'static str,
}

pub const ROUTES: &[ProviderRoute] = &[
	ProviderRoute {
		role: "deepseek",
		provider: "deepseek",
		ai_name: "DeepSeek",
		mode_prefix: "ds",
	},
	ProviderRoute {
		role: "zj-db",
		provider: "doubao",
		ai_name: "Doubao",
		mode_prefix: "db",
	},
	ProviderRoute {
		role: "yb-hunyuan-pt",
		provider: "yuanbao-t1",
		ai_name: "Yuanbao T1",
		mode_prefix: "yb-hunyuan",
	},
	ProviderRoute {
		role: "yb-deepseek-pt",
		provider: "yuanbao-ds",
		ai_name: "Yuanbao DeepSeek",
		mode_prefix: "yb-deepseek",
	},
	ProviderRoute {
		role: "baidu-agent",
		provider: "baidu",
		ai_name: "Baidu AI",
		mode_prefix: "baidu",
	},
	ProviderRoute {
		role: "ty-qw",
		provider: "tongyi",
		ai_name: "Tongyi Qianwen",
		mode_prefix: "ty-qw",
	},
];

pub fn route_for_provider(provider: &str) -> Option<&'static ProviderRoute> {
	ROUTES.iter().find(|route| route.provider == provider)
}

pub fn route_for_role(role: &str) -> Option<&'static ProviderRoute> {
	ROUTES.iter().find(|route| route.role == role)
}

/// Tasks derived from one descriptor.
#[derive(Debug, Clone)]
pub struct RoutedTasks {
	pub tasks: Vec<Task>,
	/// Submit through the dedup registry.
	pub dedup: bool,
}

/// Parses a raw channel frame and routes it.
pub fn route_frame(raw: &str) -> Result<RoutedTasks> {
	let descriptor = TaskDescriptor::from_json(raw).map_err(|err| CubeError::Descriptor(err.to_string()))?;
	route(&descriptor)
}

pub fn route(descriptor: &TaskDescriptor) -> Result<RoutedTasks> {
	let user_id = descriptor.user_id.trim();
	if user_id.is_empty() {
		return Err(CubeError::Descriptor("missing userId".into()));
	}

	if let Some(provider) = descriptor.login_check_provider() {
		let Some(route) = route_for_provider(provider) else {
			warn!(target = "cube", user_id, provider, "login check for unknown provider");
			return Err(CubeError::Descriptor(format!("unknown provider {provider}")));
		};
		let mut task = Task::check_login(user_id, route.provider).with_ai_name(route.ai_name);
		if let Some(id) = descriptor.task_id.as_deref().filter(|id| !id.is_empty()) {
			task = task.with_id(TaskId::new(id));
		}
		if let Some(kind) = descriptor.kind.as_deref() {
			task = task.with_channel_type(kind);
		}
		return Ok(RoutedTasks { tasks: vec![task], dedup: false });
	}

	let prompt = descriptor.prompt().trim();
	if prompt.is_empty() {
		return Err(CubeError::Descriptor("missing userPrompt".into()));
	}

	let routes = selected_routes(descriptor)?;
	let multiple = routes.len() > 1;
	let tasks = routes
		.into_iter()
		.map(|route| {
			let mut task = Task::generate(user_id, route.provider, prompt)
				.with_ai_name(descriptor.ai_name.as_deref().filter(|_| !multiple).unwrap_or(route.ai_name))
				.with_mode(DEEP_THINKING, descriptor.has_role(&format!("{}{DEEP_THINKING_SUFFIX}", route.mode_prefix)))
				.with_mode(WEB_SEARCH, descriptor.has_role(&format!("{}{WEB_SEARCH_SUFFIX}", route.mode_prefix)))
				.with_channel_type(descriptor.kind.as_deref().unwrap_or(DEFAULT_RESULT_TYPE))
				.with_dedup_key(format!("{user_id}:{}:{prompt}", route.provider));
			if let Some(id) = descriptor.task_id.as_deref().filter(|id| !id.is_empty()) {
				let id = if multiple { format!("{id}:{}", route.provider) } else { id.to_string() };
				task = task.with_id(TaskId::new(id));
			}
			if let Some(conversation) = descriptor.conversation_id.as_deref().filter(|id| !id.is_empty()) {
				task = task.with_conversation_id(conversation);
			}
			debug!(target = "cube", task_id = %task.id, provider = route.provider, "descriptor routed");
			task
		})
		.collect();

	Ok(RoutedTasks {
		tasks,
		dedup: descriptor.dedup.unwrap_or(false),
	})
}

fn selected_routes(descriptor: &TaskDescriptor) -> Result<Vec<&'static ProviderRoute>> {
	if let Some(provider) = descriptor.provider_key.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
		return match route_for_provider(provider) {
			Some(route) => Ok(vec![route]),
			None => {
				warn!(target = "cube", user_id = %descriptor.user_id, provider, "descriptor for unknown provider");
				Err(CubeError::Descriptor(format!("unknown provider {provider}")))
			}
		};
	}

	let routes: Vec<_> = descriptor.role_flags().into_iter().filter_map(route_for_role).collect();
	if routes.is_empty() {
		warn!(target = "cube", user_id = %descriptor.user_id, roles = ?descriptor.roles, "descriptor addresses no known provider");
		return Err(CubeError::Descriptor("no known provider in roles".into()));
	}
	Ok(routes)
}

#[cfg(test)]
mod tests {
	use cube_runtime::TaskKind;

	use super::*;

	fn descriptor(json: &str) -> TaskDescriptor {
		TaskDescriptor::from_json(json).unwrap()
	}

	#[test]
	fn roles_fan_out_one_task_per_provider() {
		let routed = route(&descriptor(r#"{"userId":"u1","taskId":"t1","type":"openAI","userPrompt":"hi","roles":"deepseek,ds-sdsk,zj-db,cube"}"#)).unwrap();
		let providers: Vec<_> = routed.tasks.iter().map(|task| task.provider.as_str()).collect();
		assert_eq!(providers, vec!["deepseek", "doubao"]);
		assert_eq!(routed.tasks[0].id.as_str(), "t1:deepseek");
		assert_eq!(routed.tasks[0].ai_name, "DeepSeek");
		assert!(routed.tasks[0].modes.is_deep_thinking());
		assert_eq!(routed.tasks[0].modes.get(WEB_SEARCH), Some(false));
		assert!(!routed.tasks[1].modes.is_deep_thinking());
		assert!(!routed.dedup);
	}

	#[test]
	fn mode_suffixes_follow_provider_prefix() {
		let routed = route(&descriptor(r#"{"userId":"u1","userPrompt":"hi","roles":"yb-hunyuan-pt,yb-hunyuan-lwss,yb-deepseek-sdsk"}"#)).unwrap();
		let task = &routed.tasks[0];
		assert_eq!(task.provider, "yuanbao-t1");
		assert_eq!(task.modes.get(WEB_SEARCH), Some(true));
		assert_eq!(task.modes.get(DEEP_THINKING), Some(false));
	}

	#[test]
	fn explicit_provider_keeps_task_id_and_ai_name() {
		let routed = route(&descriptor(r#"{"userId":"u1","taskId":"t9","prompt":"hi","providerKey":"tongyi","aiName":"Qwen","conversationId":"c-1","dedup":true}"#)).unwrap();
		let task = &routed.tasks[0];
		assert_eq!(task.id.as_str(), "t9");
		assert_eq!(task.ai_name, "Qwen");
		assert_eq!(task.conversation_id.as_deref(), Some("c-1"));
		assert_eq!(task.dedup_key.as_deref(), Some("u1:tongyi:hi"));
		assert!(routed.dedup);
	}

	#[test]
	fn login_check_builds_status_task() {
		let routed = route(&descriptor(r#"{"userId":"u1","type":"CHECK_LOGIN:deepseek"}"#)).unwrap();
		assert_eq!(routed.tasks.len(), 1);
		assert_eq!(routed.tasks[0].kind, TaskKind::CheckLogin);
		assert_eq!(routed.tasks[0].provider, "deepseek");
	}

	#[test]
	fn rejects_unroutable_descriptors() {
		assert!(route(&descriptor(r#"{"userPrompt":"hi","roles":"deepseek"}"#)).is_err());
		assert!(route(&descriptor(r#"{"userId":"u1","roles":"deepseek"}"#)).is_err());
		assert!(route(&descriptor(r#"{"userId":"u1","userPrompt":"hi","roles":"cube,ds-sdsk"}"#)).is_err());
		assert!(route(&descriptor(r#"{"userId":"u1","userPrompt":"hi","providerKey":"gemini"}"#)).is_err());
		assert!(route(&descriptor(r#"{"userId":"u1","type":"CHECK_LOGIN:gemini"}"#)).is_err());
		assert!(route_frame("{not json").is_err());
	}
}
