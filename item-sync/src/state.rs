//! In-memory projection of the item collection.
//!
//! State changes only through [`reduce`], one [`ItemsAction`] at a time.

use crate::model::{ConflictPair, Item};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemsState {
    pub items: Vec<Item>,
    pub fetching: bool,
    pub fetching_error: Option<String>,
    pub saving: bool,
    pub saving_error: Option<String>,
    pub deleting: bool,
    pub deleting_error: Option<String>,
    /// Last item removed through a delete, for undo-style display.
    pub deleted_item: Option<Item>,
}

impl ItemsState {
    pub fn find(&self, id: &str) -> Option<&Item> {
        self.items.iter().find(|item| item.id() == Some(id))
    }

    fn position(&self, item: &Item) -> Option<usize> {
        self.items.iter().position(|it| it.id == item.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemsAction {
    FetchStarted,
    FetchSucceeded(Vec<Item>),
    FetchFailed(String),
    SaveStarted,
    SaveSucceeded(Item),
    SaveFailed(String),
    /// The server kept its own version; it replaces ours in the collection.
    SaveConflicted(ConflictPair),
    DeleteStarted,
    DeleteSucceeded { id: String, item: Option<Item> },
    DeleteFailed(String),
    Reset,
}

impl ItemsAction {
    pub fn name(&self) -> &'static str {
        match self {
            ItemsAction::FetchStarted => "fetch_started",
            ItemsAction::FetchSucceeded(_) => "fetch_succeeded",
            ItemsAction::FetchFailed(_) => "fetch_failed",
            ItemsAction::SaveStarted => "save_started",
            ItemsAction::SaveSucceeded(_) => "save_succeeded",
            ItemsAction::SaveFailed(_) => "save_failed",
            ItemsAction::SaveConflicted(_) => "save_conflicted",
            ItemsAction::DeleteStarted => "delete_started",
            ItemsAction::DeleteSucceeded { .. } => "delete_succeeded",
            ItemsAction::DeleteFailed(_) => "delete_failed",
            ItemsAction::Reset => "reset",
        }
    }
}

pub fn reduce(mut state: ItemsState, action: ItemsAction) -> ItemsState {
    match action {
        ItemsAction::FetchStarted => {
            state.fetching = true;
            state.fetching_error = None;
        }
        ItemsAction::FetchSucceeded(fetched) => {
            for item in fetched {
                match state.position(&item) {
                    Some(index) => state.items[index] = item,
                    None => state.items.push(item),
                }
            }
            state.fetching = false;
            state.fetching_error = None;
        }
        ItemsAction::FetchFailed(error) => {
            state.fetching = false;
            state.fetching_error = Some(error);
        }
        ItemsAction::SaveStarted => {
            state.saving = true;
            state.saving_error = None;
        }
        ItemsAction::SaveSucceeded(item) => {
            match state.position(&item) {
                Some(index) => state.items[index] = item,
                None => state.items.insert(0, item),
            }
            state.saving = false;
        }
        ItemsAction::SaveFailed(error) => {
            state.saving = false;
            state.saving_error = Some(error);
        }
        ItemsAction::SaveConflicted(pair) => {
            if let Some(index) = state.position(&pair.server) {
                state.items[index] = pair.server;
            }
            state.saving = false;
        }
        ItemsAction::DeleteStarted => {
            state.deleting = true;
            state.deleting_error = None;
        }
        ItemsAction::DeleteSucceeded { id, item } => {
            state.items.retain(|it| it.id() != Some(id.as_str()));
            state.deleted_item = item;
            state.deleting = false;
        }
        ItemsAction::DeleteFailed(error) => {
            state.deleting = false;
            state.deleting_error = Some(error);
        }
        ItemsAction::Reset => state.items.clear(),
    }
    state
}
