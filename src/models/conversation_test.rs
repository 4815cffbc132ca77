use super::*;

#[test]
fn test_display_name() {
    let convo = Conversation::default().with_id(7);
    assert_eq!(convo.display_name(), "Chat #7");

    let convo = convo.with_name(Some("   ".to_string()));
    assert_eq!(convo.display_name(), "Chat #7");

    let convo = convo.with_name(Some("Roadmap".to_string()));
    assert_eq!(convo.display_name(), "Roadmap");
}

#[test]
fn test_is_free() {
    let convo = Conversation::default().with_id(1);
    assert!(convo.is_free());

    let convo = convo.with_project_id(Some(3));
    assert!(!convo.is_free());
    assert_eq!(convo.project_id(), Some(3));
}
