use std::fs;
use std::sync::{Arc, Mutex};

use apai_model::{ErrorKind, ModelMessage};
use apai_test_model::{PresetEvent, PresetResponse, TestModelProvider};
use tempfile::TempDir;

use crate::conversation::Role;
use crate::store::{SENTINEL, read_save};
use crate::{Agent, AgentBuilder, AgentError, StreamFragment};

fn build_agent(provider: &TestModelProvider, dir: &TempDir) -> Agent {
    AgentBuilder::with_model_provider(provider.clone())
        .with_provider_name("test")
        .with_model_id("gpt")
        .with_instruction("default", "Be helpful.")
        .with_context_len(2)
        .with_log_dir(dir.path().join("log"))
        .build()
        .unwrap()
}

fn read(path: &std::path::Path) -> String {
    fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn test_simple_message() {
    let dir = TempDir::new().unwrap();
    let provider = TestModelProvider::default();
    provider.add_response(PresetResponse::with_events([
        PresetEvent::ReasoningDelta("A greeting.".to_owned()),
        PresetEvent::MessageDelta("Hi, ".to_owned()),
        PresetEvent::MessageDelta("what can I do for you?".to_owned()),
    ]));
    let mut agent = build_agent(&provider, &dir);

    let fragments = Arc::new(Mutex::new(Vec::new()));
    let answer = agent
        .chat("Hello", None, {
            let fragments = Arc::clone(&fragments);
            move |fragment| fragments.lock().unwrap().push(fragment)
        })
        .await
        .unwrap();
    assert_eq!(answer, "Hi, what can I do for you?");
    assert_eq!(
        fragments.lock().unwrap()[0],
        StreamFragment::Reasoning("A greeting.".to_owned())
    );

    assert_eq!(agent.dialog_count(), 1);
    let (user, assistant) = agent.last_exchange().unwrap();
    assert_eq!(user.content, "Hello");
    assert_eq!(assistant.content, "Hi, what can I do for you?");

    let save = read_save(agent.save_path()).unwrap();
    assert_eq!(save.model_id, "gpt");
    assert_eq!(save.instr_key, "default");
    assert_eq!(save.blocks.len(), 2);

    let transcript = read(agent.log_path());
    assert!(transcript.contains("user:\nHello\n\n"));
    // Reasoning is shown but never stored.
    assert!(!transcript.contains("A greeting."));
}

#[tokio::test]
async fn test_file_is_prepended() {
    let dir = TempDir::new().unwrap();
    let provider = TestModelProvider::default();
    provider.add_text_response("Looks fine.");
    let mut agent = build_agent(&provider, &dir);

    agent
        .chat("Review this.", Some("fn main() {}\n\n"), |_| {})
        .await
        .unwrap();
    let requests = provider.requests();
    assert_eq!(
        requests[0].messages[1],
        ModelMessage::User("fn main() {}\nReview this.".to_owned())
    );
}

#[tokio::test]
async fn test_undo_single_exchange() {
    let dir = TempDir::new().unwrap();
    let provider = TestModelProvider::default();
    provider.add_text_response("Hi");
    let mut agent = build_agent(&provider, &dir);

    agent.chat("Hello", None, |_| {}).await.unwrap();
    agent.undo().unwrap();

    assert!(agent.conversation().turns().is_empty());
    assert_eq!(agent.last_answer(), "");
    assert!(read_save(agent.save_path()).unwrap().blocks.is_empty());
    assert!(read(agent.log_path()).ends_with("[undo]\n\n"));
}

#[tokio::test]
async fn test_retry_replaces_reply() {
    let dir = TempDir::new().unwrap();
    let provider = TestModelProvider::default();
    provider.add_text_response("Hi");
    provider.add_text_response("Paris");
    provider.add_text_response("It's Paris.");
    let mut agent = build_agent(&provider, &dir);

    agent.chat("Hello", None, |_| {}).await.unwrap();
    agent.chat("Capital of France?", None, |_| {}).await.unwrap();
    let answer = agent.retry(|_| {}).await.unwrap();
    assert_eq!(answer, "It's Paris.");

    let blocks = read_save(agent.save_path()).unwrap().blocks;
    let contents: Vec<_> = blocks.iter().map(|b| b.content.as_str()).collect();
    assert_eq!(contents, ["Hello", "Hi", "Capital of France?", "It's Paris."]);

    let transcript = read(agent.log_path());
    let retry_at = transcript.find("[retry]").unwrap();
    assert!(transcript.find("assistant:\nParis").unwrap() < retry_at);
    assert!(retry_at < transcript.find("It's Paris.").unwrap());

    // The retried request carries the question but not the old reply.
    let requests = provider.requests();
    assert_eq!(requests[1].messages, requests[2].messages);
}

#[tokio::test]
async fn test_empty_history_leaves_files_alone() {
    let dir = TempDir::new().unwrap();
    let provider = TestModelProvider::default();
    let mut agent = build_agent(&provider, &dir);

    let save_before = read(agent.save_path());
    assert!(matches!(
        agent.retry(|_| {}).await,
        Err(AgentError::EmptyHistory)
    ));
    assert!(matches!(agent.undo(), Err(AgentError::EmptyHistory)));

    assert_eq!(read(agent.save_path()), save_before);
    assert!(!agent.log_path().exists());
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn test_undo_retry_undo() {
    let dir = TempDir::new().unwrap();
    let provider = TestModelProvider::default();
    for i in 0..5 {
        provider.add_text_response(format!("answer {i}"));
    }
    provider.add_text_response("answer 4 again");
    let mut agent = build_agent(&provider, &dir);

    for i in 0..5 {
        agent
            .chat(&format!("question {i}"), None, |_| {})
            .await
            .unwrap();
    }
    agent.undo().unwrap();
    agent.retry(|_| {}).await.unwrap();
    agent.undo().unwrap();

    assert_eq!(agent.dialog_count(), 3);
    assert_eq!(agent.last_answer(), "answer 2");
    let blocks = read_save(agent.save_path()).unwrap().blocks;
    assert_eq!(blocks.len(), 6);
    assert_eq!(blocks[5].content, "answer 2");
}

#[tokio::test]
async fn test_context_window_sent() {
    let dir = TempDir::new().unwrap();
    let provider = TestModelProvider::default();
    for i in 0..4 {
        provider.add_text_response(format!("answer {i}"));
    }
    let mut agent = build_agent(&provider, &dir);

    for i in 0..4 {
        agent
            .chat(&format!("question {i}"), None, |_| {})
            .await
            .unwrap();
    }

    let last = provider.requests().pop().unwrap();
    assert_eq!(
        last.messages,
        [
            ModelMessage::System("Be helpful.".to_owned()),
            ModelMessage::User("question 2".to_owned()),
            ModelMessage::Assistant("answer 2".to_owned()),
            ModelMessage::User("question 3".to_owned()),
        ]
    );
    let usage = agent.context_usage();
    assert_eq!((usage.used, usage.len, usage.expired), (2, 2, 2));
}

#[tokio::test]
async fn test_reset_keeps_transcript() {
    let dir = TempDir::new().unwrap();
    let provider = TestModelProvider::default();
    provider.add_text_response("Hi");
    provider.add_text_response("Hi again");
    let mut agent = build_agent(&provider, &dir);

    agent.chat("Hello", None, |_| {}).await.unwrap();
    agent.reset().unwrap();

    assert!(agent.conversation().turns().is_empty());
    assert_eq!(read(agent.save_path()), format!("gpt, default\n{SENTINEL}\n"));
    let transcript = read(agent.log_path());
    assert!(transcript.contains("user:\nHello"));

    agent.chat("Hello", None, |_| {}).await.unwrap();
    let transcript = read(agent.log_path());
    assert_eq!(transcript.matches("model_id: gpt").count(), 2);
}

#[tokio::test]
async fn test_provider_failure_leaves_pending_turn() {
    let dir = TempDir::new().unwrap();
    let provider = TestModelProvider::default();
    provider.add_response(
        PresetResponse::with_events([
            PresetEvent::MessageDelta("Half ".to_owned()),
            PresetEvent::MessageDelta("answer".to_owned()),
        ])
        .with_failures(1),
    );
    provider.add_text_response("Fine.");
    let mut agent = build_agent(&provider, &dir);

    let err = agent.chat("Hello", None, |_| {}).await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::ProviderStream {
            kind: ErrorKind::Other,
            ..
        }
    ));
    assert!(agent.conversation().has_pending());
    assert_eq!(agent.dialog_count(), 1);
    assert_eq!(read_save(agent.save_path()).unwrap().blocks.len(), 1);
    assert!(!read(agent.log_path()).contains("Half"));

    // Retrying sends the pending question again without popping it.
    let answer = agent.retry(|_| {}).await.unwrap();
    assert_eq!(answer, "Half answer");
    let blocks = read_save(agent.save_path()).unwrap().blocks;
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].role, Role::User);
}

#[tokio::test]
async fn test_new_chat_replaces_pending_turn() {
    let dir = TempDir::new().unwrap();
    let provider = TestModelProvider::default();
    provider.add_response(PresetResponse::with_text("lost").with_failures(1));
    let mut agent = build_agent(&provider, &dir);

    agent.chat("First try", None, |_| {}).await.unwrap_err();
    agent.chat("Second try", None, |_| {}).await.unwrap();

    let turns = agent.conversation().turns();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].content, "Second try");
    let blocks = read_save(agent.save_path()).unwrap().blocks;
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].content, "Second try");
    // The transcript keeps everything that was sent.
    assert!(read(agent.log_path()).contains("First try"));
}

#[tokio::test]
async fn test_restore_and_continue() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("saves").join("trip.apai");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(
        &path,
        format!(
            "gpt, default\n{SENTINEL}\nuser\nPlan a trip\n{SENTINEL}\n\
             assistant\nGo to Rome.\n{SENTINEL}\n"
        ),
    )
    .unwrap();
    let save = read_save(&path).unwrap();

    let provider = TestModelProvider::default();
    provider.add_text_response("Three days.");
    let mut agent = AgentBuilder::with_model_provider(provider.clone())
        .with_model_id("gpt")
        .with_instruction("default", "Be helpful.")
        .with_log_dir(dir.path().join("log"))
        .with_restored(save, &path)
        .build()
        .unwrap();

    assert_eq!(agent.dialog_count(), 1);
    assert_eq!(agent.last_answer(), "Go to Rome.");
    assert!(agent.conversation().turns()[0].timestamp.is_none());
    assert_eq!(agent.save_path(), path);

    agent.chat("How long?", None, |_| {}).await.unwrap();
    assert_eq!(read_save(&path).unwrap().blocks.len(), 4);
    assert_eq!(provider.requests()[0].messages.len(), 4);
}

#[tokio::test]
async fn test_save_as_rebinds() {
    let dir = TempDir::new().unwrap();
    let provider = TestModelProvider::default();
    provider.add_text_response("Hi");
    provider.add_text_response("Bye");
    let mut agent = build_agent(&provider, &dir);

    agent.chat("Hello", None, |_| {}).await.unwrap();
    let target = dir.path().join("saves").join("greeting.apai");
    agent.save_as(&target).unwrap();
    agent.chat("Goodbye", None, |_| {}).await.unwrap();

    assert_eq!(read_save(&target).unwrap().blocks.len(), 4);
    let working = dir.path().join("log").join("gpt.apai");
    assert_eq!(read_save(&working).unwrap().blocks.len(), 2);
}

#[tokio::test]
async fn test_restore_replaces_conversation() {
    let dir = TempDir::new().unwrap();
    let provider = TestModelProvider::default();
    provider.add_text_response("Hi");
    let mut agent = build_agent(&provider, &dir);
    agent.chat("Hello", None, |_| {}).await.unwrap();

    let path = dir.path().join("saves").join("empty.apai");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, format!("gpt, default\n{SENTINEL}\n")).unwrap();
    agent.restore(read_save(&path).unwrap(), &path).unwrap();

    assert_eq!(agent.dialog_count(), 0);
    assert_eq!(agent.last_answer(), "");
    assert_eq!(agent.save_path(), path);
    assert!(matches!(agent.undo(), Err(AgentError::EmptyHistory)));
}

#[tokio::test]
async fn test_undo_pending_exchange() {
    let dir = TempDir::new().unwrap();
    let provider = TestModelProvider::default();
    provider.add_response(PresetResponse::with_text("lost").with_failures(1));
    let mut agent = build_agent(&provider, &dir);

    agent.chat("Hello", None, |_| {}).await.unwrap_err();
    agent.undo().unwrap();

    assert!(agent.conversation().turns().is_empty());
    assert_eq!(agent.dialog_count(), 0);
    assert!(read_save(agent.save_path()).unwrap().blocks.is_empty());
    assert!(read(agent.log_path()).ends_with("[undo]\n\n"));
}

#[tokio::test]
async fn test_restored_save_with_trailing_blank_lines() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("saves").join("loose.apai");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(
        &path,
        format!(
            "gpt, default\n{SENTINEL}\nuser\nHey\n{SENTINEL}\n\
             assistant\nYo\n{SENTINEL}\n\n\n"
        ),
    )
    .unwrap();

    let provider = TestModelProvider::default();
    provider.add_text_response("Sure.");
    let mut agent = AgentBuilder::with_model_provider(provider.clone())
        .with_model_id("gpt")
        .with_instruction("default", "Be helpful.")
        .with_log_dir(dir.path().join("log"))
        .with_restored(read_save(&path).unwrap(), &path)
        .build()
        .unwrap();

    agent.chat("One more", None, |_| {}).await.unwrap();
    assert_eq!(read_save(&path).unwrap().blocks.len(), 4);
    agent.undo().unwrap();

    let blocks = read_save(&path).unwrap().blocks;
    let contents: Vec<_> = blocks.iter().map(|b| b.content.as_str()).collect();
    assert_eq!(contents, ["Hey", "Yo"]);
    assert_eq!(agent.dialog_count(), 1);
}

#[tokio::test]
async fn test_undo_keeps_window_when_marker_fails() {
    let dir = TempDir::new().unwrap();
    let provider = TestModelProvider::default();
    provider.add_text_response("Hi");
    let mut agent = build_agent(&provider, &dir);
    agent.chat("Hello", None, |_| {}).await.unwrap();

    // A directory in place of the transcript makes every append fail.
    fs::remove_file(agent.log_path()).unwrap();
    fs::create_dir(agent.log_path()).unwrap();

    let err = agent.undo().unwrap_err();
    assert!(matches!(err, AgentError::Store(_)));
    assert!(agent.conversation().turns().is_empty());
    assert!(read_save(agent.save_path()).unwrap().blocks.is_empty());
}
