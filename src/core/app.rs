//! Caller-facing service tying characters, trees, providers, and streaming
//! sessions together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::character::Character;
use crate::core::chat_stream::{SessionId, StreamController, StreamEvent};
use crate::core::context::{CharEstimator, TokenEstimator};
use crate::core::error::{Error, Result};
use crate::core::message::{Message, MessageId, Role};
use crate::core::providers::ProviderRegistry;
use crate::core::retry::RetryPolicy;
use crate::core::tree::{ConversationTree, SharedTree};
use crate::core::tree_store::TreeStore;

type SessionMap = Arc<Mutex<HashMap<SessionId, CancellationToken>>>;

/// A running generation. Events arrive on `events` until the session ends;
/// [`wait`](Self::wait) yields the committed message or the final error.
pub struct GenerationHandle {
    pub session_id: SessionId,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
    task: JoinHandle<Result<Message>>,
}

impl GenerationHandle {
    pub async fn wait(self) -> Result<Message> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(Error::InvalidState(format!(
                "generation task for session {} ended abnormally: {err}",
                self.session_id
            ))),
        }
    }
}

pub struct ChatService {
    registry: Arc<ProviderRegistry>,
    retry: RetryPolicy,
    estimator: Arc<dyn TokenEstimator>,
    store: Option<Arc<dyn TreeStore>>,
    user_name: String,
    characters: RwLock<HashMap<String, Character>>,
    trees: tokio::sync::Mutex<HashMap<String, SharedTree>>,
    sessions: SessionMap,
}

impl ChatService {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            retry: RetryPolicy::default(),
            estimator: Arc::new(CharEstimator::default()),
            store: None,
            user_name: "User".to_string(),
            characters: RwLock::new(HashMap::new()),
            trees: tokio::sync::Mutex::new(HashMap::new()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TreeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_user_name(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = user_name.into();
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Register or replace a character. An already loaded tree keeps its
    /// persona root.
    pub fn add_character(&self, character: Character) {
        self.characters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(character.id.clone(), character);
    }

    pub fn character(&self, id: &str) -> Result<Character> {
        self.characters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("character '{id}'")))
    }

    pub fn characters(&self) -> Vec<Character> {
        let mut characters: Vec<_> = self
            .characters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        characters.sort_by(|a, b| a.id.cmp(&b.id));
        characters
    }

    /// The character's conversation tree, loaded from the store on first use
    /// or seeded with the persona and greeting when nothing was saved.
    pub async fn tree(&self, character_id: &str) -> Result<SharedTree> {
        let character = self.character(character_id)?;
        let mut trees = self.trees.lock().await;
        if let Some(tree) = trees.get(character_id) {
            return Ok(tree.clone());
        }

        let tree = match self.load_tree(character_id)? {
            Some(tree) => tree,
            None => self.seed_tree(&character)?,
        };
        let shared: SharedTree = Arc::new(tokio::sync::Mutex::new(tree));
        trees.insert(character_id.to_string(), shared.clone());
        Ok(shared)
    }

    fn load_tree(&self, character_id: &str) -> Result<Option<ConversationTree>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let snapshot = store
            .load(character_id)
            .map_err(|err| Error::Storage(err.to_string()))?;
        let Some(snapshot) = snapshot else {
            return Ok(None);
        };
        let tree = ConversationTree::from_snapshot(snapshot).map_err(|err| {
            Error::Storage(format!("saved tree for '{character_id}' is invalid: {err}"))
        })?;
        debug!(character = %character_id, messages = tree.len(), "restored conversation tree");
        Ok(Some(tree))
    }

    fn seed_tree(&self, character: &Character) -> Result<ConversationTree> {
        let mut tree = ConversationTree::new();
        let root = tree.add_root(Role::System, character.system_prompt(&self.user_name))?;
        if let Some(greeting) = character.greeting_for(&self.user_name) {
            tree.append_message(root.id, Role::Assistant, greeting, None)?;
        }
        debug!(character = %character.id, "started a new conversation tree");
        Ok(tree)
    }

    /// Commit `user_input` under the active leaf and generate a reply to it.
    ///
    /// The provider is `config_id` when given, else the character's preferred
    /// provider, else the registry default.
    ///
    /// The user turn stays in the tree when the generation fails or is
    /// cancelled. Use [`ChatService::retry`] to answer it again; calling this
    /// a second time appends another user turn below the first.
    pub async fn start_generation(
        &self,
        character_id: &str,
        config_id: Option<&str>,
        user_input: &str,
    ) -> Result<GenerationHandle> {
        if user_input.trim().is_empty() {
            return Err(Error::InvalidState("user input is empty".to_string()));
        }
        let config_id = self.resolve_provider(character_id, config_id)?;
        let tree = self.tree(character_id).await?;
        let parent = {
            let mut tree = tree.lock().await;
            let message = match tree.active_leaf() {
                Some(leaf) => tree.append_message(leaf, Role::User, user_input, None)?,
                None => tree.add_root(Role::User, user_input)?,
            };
            message.id
        };
        Ok(self.spawn(character_id, tree, parent, config_id))
    }

    /// Generate a replacement for assistant message `message_id`; the new
    /// reply becomes the active sibling.
    pub async fn regenerate(
        &self,
        character_id: &str,
        message_id: MessageId,
        config_id: Option<&str>,
    ) -> Result<GenerationHandle> {
        let config_id = self.resolve_provider(character_id, config_id)?;
        let tree = self.tree(character_id).await?;
        let parent = tree.lock().await.regeneration_parent(&message_id)?;
        Ok(self.spawn(character_id, tree, parent, config_id))
    }

    /// Generate a reply to the active leaf, which must be a user message left
    /// unanswered by a failed or cancelled generation.
    pub async fn retry(
        &self,
        character_id: &str,
        config_id: Option<&str>,
    ) -> Result<GenerationHandle> {
        let config_id = self.resolve_provider(character_id, config_id)?;
        let tree = self.tree(character_id).await?;
        let parent = {
            let tree = tree.lock().await;
            let leaf = tree
                .active_leaf()
                .and_then(|id| tree.get(&id))
                .ok_or_else(|| Error::InvalidState("conversation is empty".to_string()))?;
            if !leaf.is_user() {
                return Err(Error::InvalidState(format!(
                    "nothing to retry: the latest message is a {} message",
                    leaf.role
                )));
            }
            leaf.id
        };
        Ok(self.spawn(character_id, tree, parent, config_id))
    }

    /// Request cancellation of a running session.
    pub fn cancel(&self, session_id: SessionId) -> Result<()> {
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let token = sessions
            .get(&session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        token.cancel();
        info!(session = %session_id, "cancellation requested");
        Ok(())
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut sessions: Vec<_> = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .copied()
            .collect();
        sessions.sort();
        sessions
    }

    pub async fn active_path(&self, character_id: &str) -> Result<Vec<Message>> {
        let tree = self.tree(character_id).await?;
        let path = tree.lock().await.active_path(None)?;
        Ok(path)
    }

    pub async fn select_branch(&self, character_id: &str, message_id: MessageId) -> Result<()> {
        let tree = self.tree(character_id).await?;
        tree.lock().await.select_branch(message_id)?;
        self.save(character_id, &tree).await
    }

    /// Delete `message_id` and everything below it.
    pub async fn delete_subtree(
        &self,
        character_id: &str,
        message_id: MessageId,
    ) -> Result<Vec<MessageId>> {
        let tree = self.tree(character_id).await?;
        let removed = tree.lock().await.delete_subtree(message_id)?;
        self.save(character_id, &tree).await?;
        Ok(removed)
    }

    async fn save(&self, character_id: &str, tree: &SharedTree) -> Result<()> {
        persist(self.store.as_deref(), character_id, tree)
            .await
            .map_err(Error::Storage)
    }

    fn resolve_provider(&self, character_id: &str, requested: Option<&str>) -> Result<String> {
        let character = self.character(character_id)?;
        self.registry
            .resolve_id(requested, character.provider.as_deref())
    }

    fn spawn(
        &self,
        character_id: &str,
        tree: SharedTree,
        parent: MessageId,
        config_id: String,
    ) -> GenerationHandle {
        let (mut controller, events) = StreamController::new(
            self.registry.clone(),
            self.retry,
            self.estimator.clone(),
        );
        let session_id = controller.session_id();
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session_id, controller.cancel_token());

        let sessions = self.sessions.clone();
        let store = self.store.clone();
        let character_id = character_id.to_string();
        let task = tokio::spawn(async move {
            let result = controller.start(&tree, parent, &config_id).await;
            sessions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&session_id);
            // The user turn is already in the tree, so save whatever the outcome.
            if let Err(err) = persist(store.as_deref(), &character_id, &tree).await {
                warn!(character = %character_id, error = %err, "failed to save conversation tree");
            }
            result
        });

        GenerationHandle {
            session_id,
            events,
            task,
        }
    }
}

async fn persist(
    store: Option<&dyn TreeStore>,
    character_id: &str,
    tree: &SharedTree,
) -> std::result::Result<(), String> {
    let Some(store) = store else {
        return Ok(());
    };
    let snapshot = tree.lock().await.to_snapshot();
    store
        .save(character_id, &snapshot)
        .map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::providers::ProviderError;
    use crate::core::tree_store::MemoryTreeStore;
    use crate::utils::test_utils::{aria, scripted_config, test_client, ScriptedAdapter};
    use std::time::Duration;

    fn service(adapters: Vec<ScriptedAdapter>) -> (ChatService, Arc<MemoryTreeStore>) {
        let registry = Arc::new(ProviderRegistry::new(test_client()));
        for adapter in adapters {
            registry
                .add_adapter(Arc::new(adapter))
                .expect("register adapter");
        }
        let store = Arc::new(MemoryTreeStore::new());
        let service = ChatService::new(registry)
            .with_store(store.clone())
            .with_user_name("Sam")
            .with_retry_policy(
                RetryPolicy::new(3)
                    .with_base_delay(Duration::from_millis(1))
                    .with_jitter(0.0),
            );
        (service, store)
    }

    fn plain_aria() -> Character {
        Character::new("aria", "Aria", "You are Aria.")
    }

    async fn contents(service: &ChatService, character_id: &str) -> Vec<String> {
        service
            .active_path(character_id)
            .await
            .expect("active path")
            .into_iter()
            .map(|message| message.content)
            .collect()
    }

    #[tokio::test]
    async fn aria_conversation_commits_streamed_reply() {
        let (service, _store) = service(vec![ScriptedAdapter::new(scripted_config("local"))
            .reply(&["Hi", " there", "!"])]);
        service.add_character(plain_aria());

        let mut handle = service
            .start_generation("aria", None, "hi")
            .await
            .expect("generation starts");
        let mut streamed = String::new();
        while let Some(event) = handle.events.recv().await {
            if let StreamEvent::Delta(text) = event {
                streamed.push_str(&text);
            }
        }
        let reply = handle.wait().await.expect("reply");

        assert_eq!(streamed, "Hi there!");
        assert_eq!(reply.content, "Hi there!");
        assert_eq!(
            contents(&service, "aria").await,
            vec!["You are Aria.", "hi", "Hi there!"]
        );
        assert!(service.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn regenerated_replies_are_selectable_siblings() {
        let (service, _store) = service(vec![ScriptedAdapter::new(scripted_config("local"))
            .reply(&["Hi", " there", "!"])
            .reply(&["Hey", "!"])]);
        service.add_character(plain_aria());

        let first = service
            .start_generation("aria", None, "hi")
            .await
            .expect("start")
            .wait()
            .await
            .expect("first reply");
        let second = service
            .regenerate("aria", first.id, None)
            .await
            .expect("regenerate")
            .wait()
            .await
            .expect("second reply");

        assert_eq!(
            contents(&service, "aria").await,
            vec!["You are Aria.", "hi", "Hey!"]
        );
        service
            .select_branch("aria", first.id)
            .await
            .expect("select first");
        assert_eq!(
            contents(&service, "aria").await,
            vec!["You are Aria.", "hi", "Hi there!"]
        );
        service
            .select_branch("aria", second.id)
            .await
            .expect("select second");
        assert_eq!(
            contents(&service, "aria").await.last().map(String::as_str),
            Some("Hey!")
        );

        let tree = service.tree("aria").await.expect("tree");
        assert_eq!(
            tree.lock().await.siblings(&first.id).expect("siblings"),
            vec![first.id, second.id]
        );
    }

    #[tokio::test]
    async fn new_tree_is_seeded_with_persona_and_greeting() {
        let (service, _store) = service(vec![]);
        service.add_character(aria());
        assert_eq!(
            contents(&service, "aria").await,
            vec!["A cheerful guide who loves Sam.", "Hello! I'm Aria."]
        );
        assert!(matches!(
            service.tree("nobody").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_generation_keeps_only_the_user_turn() {
        let (service, _store) = service(vec![
            ScriptedAdapter::new(scripted_config("local")).stall_after(&["Hel"])
        ]);
        service.add_character(plain_aria());

        let mut handle = service
            .start_generation("aria", None, "hi")
            .await
            .expect("start");
        assert_eq!(service.active_sessions(), vec![handle.session_id]);
        loop {
            match handle.events.recv().await {
                Some(StreamEvent::Delta(_)) => break,
                Some(_) => continue,
                None => panic!("session ended before streaming"),
            }
        }
        service.cancel(handle.session_id).expect("cancel");

        let session_id = handle.session_id;
        assert_eq!(handle.wait().await, Err(Error::Cancelled));
        assert_eq!(contents(&service, "aria").await, vec!["You are Aria.", "hi"]);
        assert!(matches!(service.cancel(session_id), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn failed_generation_can_be_retried() {
        let (service, _store) = service(vec![ScriptedAdapter::new(scripted_config("local"))
            .fail(ProviderError::Auth("expired key".into()))
            .reply(&["Hello again"])]);
        service.add_character(plain_aria());

        let err = service
            .start_generation("aria", None, "hi")
            .await
            .expect("start")
            .wait()
            .await
            .expect_err("auth failure");
        assert!(matches!(err, Error::Provider(ProviderError::Auth(_))));
        assert_eq!(contents(&service, "aria").await, vec!["You are Aria.", "hi"]);

        let reply = service
            .retry("aria", None)
            .await
            .expect("retry starts")
            .wait()
            .await
            .expect("retry succeeds");
        assert_eq!(reply.content, "Hello again");
        assert_eq!(
            contents(&service, "aria").await,
            vec!["You are Aria.", "hi", "Hello again"]
        );

        assert!(matches!(
            service.retry("aria", None).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn provider_resolution_prefers_explicit_then_character() {
        let (service, _store) = service(vec![
            ScriptedAdapter::new(scripted_config("default")).reply(&["from default"]),
            ScriptedAdapter::new(scripted_config("favorite"))
                .reply(&["from favorite"])
                .reply(&["explicit favorite"]),
        ]);
        service.add_character(plain_aria().with_provider("favorite"));
        service.add_character(Character::new("bob", "Bob", "You are Bob."));

        let reply = service
            .start_generation("aria", None, "hi")
            .await
            .expect("start")
            .wait()
            .await
            .expect("reply");
        assert_eq!(reply.provider.map(|meta| meta.provider_id).as_deref(), Some("favorite"));

        let reply = service
            .start_generation("bob", None, "hi")
            .await
            .expect("start")
            .wait()
            .await
            .expect("reply");
        assert_eq!(reply.content, "from default");

        let reply = service
            .start_generation("bob", Some("favorite"), "again")
            .await
            .expect("start")
            .wait()
            .await
            .expect("reply");
        assert_eq!(reply.content, "explicit favorite");

        assert!(matches!(
            service.start_generation("bob", Some("missing"), "hi").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn trees_are_saved_and_restored() {
        let (service, store) = service(vec![
            ScriptedAdapter::new(scripted_config("local")).reply(&["Hi there!"])
        ]);
        service.add_character(plain_aria());
        service
            .start_generation("aria", None, "hi")
            .await
            .expect("start")
            .wait()
            .await
            .expect("reply");
        assert_eq!(store.keys(), vec!["aria"]);

        let registry = service.registry().clone();
        let restored = ChatService::new(registry).with_store(store);
        restored.add_character(plain_aria());
        assert_eq!(
            contents(&restored, "aria").await,
            vec!["You are Aria.", "hi", "Hi there!"]
        );
    }

    #[tokio::test]
    async fn delete_subtree_drops_branch_and_persists() {
        let (service, store) = service(vec![
            ScriptedAdapter::new(scripted_config("local")).reply(&["Hi there!"])
        ]);
        service.add_character(plain_aria());
        let reply = service
            .start_generation("aria", None, "hi")
            .await
            .expect("start")
            .wait()
            .await
            .expect("reply");

        let user = reply.parent.expect("reply has a parent");
        let removed = service
            .delete_subtree("aria", user)
            .await
            .expect("delete");
        assert_eq!(removed.len(), 2);
        assert_eq!(contents(&service, "aria").await, vec!["You are Aria."]);
        let saved = store.load("aria").expect("load").expect("snapshot");
        assert_eq!(saved.messages.len(), 1);
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let (service, _store) = service(vec![ScriptedAdapter::new(scripted_config("local"))]);
        service.add_character(plain_aria());
        assert!(matches!(
            service.start_generation("aria", None, "   ").await,
            Err(Error::InvalidState(_))
        ));
        assert_eq!(contents(&service, "aria").await, vec!["You are Aria."]);
    }
}
