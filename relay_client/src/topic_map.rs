use {
    relay_rpc::domain::{SubscriptionId, Topic},
    std::collections::{BTreeMap, BTreeSet},
};

/// Subscription ids per topic. A topic stays mapped while it has at least one
/// id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicMap {
    map: BTreeMap<Topic, BTreeSet<SubscriptionId>>,
}

impl TopicMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, topic: Topic, id: SubscriptionId) {
        self.map.entry(topic).or_default().insert(id);
    }

    pub fn get(&self, topic: &Topic) -> Vec<SubscriptionId> {
        self.map
            .get(topic)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn exists(&self, topic: &Topic, id: &SubscriptionId) -> bool {
        self.map.get(topic).is_some_and(|ids| ids.contains(id))
    }

    pub fn has_topic(&self, topic: &Topic) -> bool {
        self.map.contains_key(topic)
    }

    /// Removes one id, or the whole topic when `id` is `None`.
    pub fn delete(&mut self, topic: &Topic, id: Option<&SubscriptionId>) {
        let Some(id) = id else {
            self.map.remove(topic);
            return;
        };

        if let Some(ids) = self.map.get_mut(topic) {
            ids.remove(id);
            if ids.is_empty() {
                self.map.remove(topic);
            }
        }
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.map.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_lives_while_it_has_ids() {
        let mut map = TopicMap::new();
        let topic = Topic::from("topic");
        let first = SubscriptionId::from("first");
        let second = SubscriptionId::from("second");

        map.set(topic.clone(), first.clone());
        map.set(topic.clone(), second.clone());
        map.set(topic.clone(), second.clone());
        assert_eq!(map.get(&topic), vec![first.clone(), second.clone()]);
        assert!(map.exists(&topic, &first));

        map.delete(&topic, Some(&first));
        assert!(map.has_topic(&topic));
        map.delete(&topic, Some(&second));
        assert!(!map.has_topic(&topic));
        assert!(map.is_empty());

        map.set(topic.clone(), first);
        map.delete(&topic, None);
        assert!(map.topics().is_empty());
    }
}
