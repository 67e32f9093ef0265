//! `#[derive(Inject)]` routing
#![cfg(feature = "derive")]

use std::sync::Arc;
use tree_injector::{Component, Dependency, Inject, Instance, TypeBinding, TypeKey};

#[derive(Default, Inject)]
struct Player {
    #[needs]
    audio: Dependency,
    #[needs(field = "input_system")]
    input: Dependency,
    score: u64,
}

impl Component for Player {}

#[derive(Default, Inject)]
struct Marker;

impl Component for Marker {}

fn marker() -> Instance {
    let key = TypeKey::new("Game.Marker");
    Instance::new(key.clone(), Arc::new(Marker), Arc::new(TypeBinding::empty(key)))
}

#[test]
fn test_routes_marked_fields() {
    let player = Player::default();
    let audio = marker();
    let input = marker();

    assert!(player.inject("audio", audio.clone()));
    assert!(player.inject("input_system", input.clone()));
    assert_eq!(player.audio.get(), Some(&audio));
    assert_eq!(player.input.get(), Some(&input));
    assert_eq!(player.score, 0);
}

#[test]
fn test_unknown_fields_are_rejected() {
    let player = Player::default();
    assert!(!player.inject("input", marker()));
    assert!(!player.inject("score", marker()));
    assert!(!Marker.inject("audio", marker()));
}
