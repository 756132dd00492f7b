use super::schema::{ConfigDocument, SchemaKind};
use crate::errors::{AppError, AppResult};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// An entry that can live inside an [`OrderedSet`].
pub trait ConfigEntry: Clone + Sized {
    fn load_entry(raw: &Value) -> AppResult<Self>;
    fn entry_dict(&self) -> Value;
}

impl ConfigEntry for ConfigDocument {
    fn load_entry(raw: &Value) -> AppResult<Self> {
        Ok(ConfigDocument::from_value(SchemaKind::Profile, raw))
    }

    fn entry_dict(&self) -> Value {
        self.to_dict()
    }
}

/// Ordered UID map. Insertion order is execution order and `order` is always a
/// permutation of the keys.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedSet<T> {
    order: Vec<Uuid>,
    entries: HashMap<Uuid, T>,
}

pub type ProfileSet = OrderedSet<ConfigDocument>;

impl<T> Default for OrderedSet<T> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            entries: HashMap::new(),
        }
    }
}

impl<T: ConfigEntry> OrderedSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn add(&mut self, entry: T) -> Uuid {
        let uid = Uuid::new_v4();
        self.order.push(uid);
        self.entries.insert(uid, entry);
        uid
    }

    pub fn insert(&mut self, uid: Uuid, entry: T) {
        if self.entries.insert(uid, entry).is_none() {
            self.order.push(uid);
        }
    }

    pub fn remove(&mut self, uid: &Uuid) -> AppResult<T> {
        let entry = self
            .entries
            .remove(uid)
            .ok_or_else(|| AppError::NotFound(format!("config entry {}", uid)))?;
        self.order.retain(|known| known != uid);
        Ok(entry)
    }

    pub fn get(&self, uid: &Uuid) -> Option<&T> {
        self.entries.get(uid)
    }

    pub fn get_mut(&mut self, uid: &Uuid) -> Option<&mut T> {
        self.entries.get_mut(uid)
    }

    pub fn contains(&self, uid: &Uuid) -> bool {
        self.entries.contains_key(uid)
    }

    pub fn order(&self) -> &[Uuid] {
        &self.order
    }

    pub fn set_order(&mut self, order: Vec<Uuid>) -> AppResult<()> {
        let proposed: BTreeSet<&Uuid> = order.iter().collect();
        let current: BTreeSet<&Uuid> = self.entries.keys().collect();
        if proposed.len() != order.len() || proposed != current {
            return Err(AppError::ConfigInvalid(
                "new order must be a permutation of the existing entries".to_string(),
            ));
        }
        self.order = order;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &T)> {
        self.order
            .iter()
            .filter_map(|uid| self.entries.get(uid).map(|entry| (uid, entry)))
    }

    pub fn load(raw: &Value) -> AppResult<Self> {
        let instances = raw
            .get("instances")
            .and_then(Value::as_array)
            .ok_or_else(|| AppError::ConfigInvalid("missing instances list".to_string()))?;
        let data = raw
            .get("data")
            .and_then(Value::as_object)
            .ok_or_else(|| AppError::ConfigInvalid("missing data map".to_string()))?;

        let mut set = Self::new();
        for instance in instances {
            let uid = instance
                .as_str()
                .and_then(|text| Uuid::parse_str(text).ok())
                .ok_or_else(|| AppError::ConfigInvalid(format!("invalid uid {}", instance)))?;
            match data.get(&uid.to_string()) {
                Some(entry) => set.insert(uid, T::load_entry(entry)?),
                None => tracing::warn!(uid = %uid, "dropping ordered uid without data"),
            }
        }
        for (key, entry) in data {
            let uid = Uuid::parse_str(key)
                .map_err(|_| AppError::ConfigInvalid(format!("invalid uid {}", key)))?;
            if !set.contains(&uid) {
                set.insert(uid, T::load_entry(entry)?);
            }
        }
        Ok(set)
    }

    pub fn to_dict(&self) -> Value {
        let instances = self
            .order
            .iter()
            .map(|uid| Value::String(uid.to_string()))
            .collect::<Vec<_>>();
        let mut data = serde_json::Map::new();
        for (uid, entry) in self.iter() {
            data.insert(uid.to_string(), entry.entry_dict());
        }
        serde_json::json!({ "instances": instances, "data": data })
    }
}
