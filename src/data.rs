//! Interaction storage, training instance generation and minibatching.
use rand::distributions::{Distribution, Uniform};
use rand::seq::SliceRandom;
use rand::Rng;

use super::{ItemId, UserId};

/// A single (user, item) implicit-feedback interaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interaction {
    user_id: UserId,
    item_id: ItemId,
}

impl Interaction {
    /// Build a new interaction.
    pub fn new(user_id: UserId, item_id: ItemId) -> Self {
        Interaction { user_id, item_id }
    }

    /// The interacting user.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// The item interacted with.
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }
}

/// A held-out test interaction with its sampled negative items.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestCase {
    /// The user being evaluated.
    pub user_id: UserId,
    /// The held-out item the user actually interacted with.
    pub item_id: ItemId,
    /// Items the held-out item is ranked against.
    pub negatives: Vec<ItemId>,
}

/// A list of interactions in their original order.
#[derive(Clone, Debug)]
pub struct Interactions {
    num_users: usize,
    num_items: usize,
    interactions: Vec<Interaction>,
}

impl Interactions {
    /// Build an empty interaction set for the given shape.
    pub fn new(num_users: usize, num_items: usize) -> Self {
        Interactions {
            num_users,
            num_items,
            interactions: Vec::new(),
        }
    }

    /// Append an interaction. Grows the shape if necessary.
    pub fn push(&mut self, interaction: Interaction) {
        self.num_users = self.num_users.max(interaction.user_id() + 1);
        self.num_items = self.num_items.max(interaction.item_id() + 1);
        self.interactions.push(interaction);
    }

    /// Return the underlying interactions.
    pub fn data(&self) -> &[Interaction] {
        &self.interactions
    }

    /// Number of interactions.
    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    /// Whether there are no interactions.
    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    /// Widen the shape, e.g. to cover items only seen in test data.
    pub fn reshape(&mut self, num_users: usize, num_items: usize) {
        self.num_users = self.num_users.max(num_users);
        self.num_items = self.num_items.max(num_items);
    }

    /// Convert to per-user compressed form.
    pub fn to_compressed(&self) -> CompressedInteractions {
        CompressedInteractions::from(self)
    }

    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of items.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// `(num_users, num_items)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_users, self.num_items)
    }
}

impl From<Vec<Interaction>> for Interactions {
    fn from(data: Vec<Interaction>) -> Interactions {
        let num_users = data.iter().map(|x| x.user_id() + 1).max().unwrap_or(0);
        let num_items = data.iter().map(|x| x.item_id() + 1).max().unwrap_or(0);

        Interactions {
            num_users,
            num_items,
            interactions: data,
        }
    }
}

/// Interactions grouped by user.
///
/// Within a user, items keep the order in which they were recorded.
#[derive(Clone, Debug)]
pub struct CompressedInteractions {
    num_users: usize,
    num_items: usize,
    user_pointers: Vec<usize>,
    item_ids: Vec<ItemId>,
}

impl<'a> From<&'a Interactions> for CompressedInteractions {
    fn from(interactions: &Interactions) -> CompressedInteractions {
        let mut data = interactions.data().to_owned();

        // Stable: preserves per-user file order.
        data.sort_by_key(|x| x.user_id());

        let mut user_pointers = vec![0; interactions.num_users + 1];
        let mut item_ids = Vec::with_capacity(data.len());

        for datum in &data {
            item_ids.push(datum.item_id());
            user_pointers[datum.user_id() + 1] += 1;
        }

        for idx in 1..user_pointers.len() {
            user_pointers[idx] += user_pointers[idx - 1];
        }

        CompressedInteractions {
            num_users: interactions.num_users,
            num_items: interactions.num_items,
            user_pointers,
            item_ids,
        }
    }
}

impl CompressedInteractions {
    /// Iterate over users, including those without interactions.
    pub fn iter_users(&self) -> CompressedInteractionsUserIterator {
        CompressedInteractionsUserIterator {
            interactions: self,
            idx: 0,
        }
    }

    /// Get a single user's interactions.
    pub fn get_user(&self, user_id: UserId) -> Option<CompressedInteractionsUser> {
        if user_id >= self.num_users {
            return None;
        }

        let start = self.user_pointers[user_id];
        let stop = self.user_pointers[user_id + 1];

        Some(CompressedInteractionsUser {
            user_id,
            item_ids: &self.item_ids[start..stop],
        })
    }

    /// Total number of interactions.
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    /// Whether there are no interactions.
    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }

    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of items.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// `(num_users, num_items)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_users, self.num_items)
    }
}

/// Iterator over users of a [`CompressedInteractions`].
pub struct CompressedInteractionsUserIterator<'a> {
    interactions: &'a CompressedInteractions,
    idx: usize,
}

/// One user's interactions.
#[derive(Debug)]
pub struct CompressedInteractionsUser<'a> {
    /// The user.
    pub user_id: UserId,
    /// Items the user interacted with, in recorded order.
    pub item_ids: &'a [ItemId],
}

impl<'a> CompressedInteractionsUser<'a> {
    /// Number of interactions of this user.
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    /// Whether the user has no interactions.
    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }
}

impl<'a> Iterator for CompressedInteractionsUserIterator<'a> {
    type Item = CompressedInteractionsUser<'a>;
    fn next(&mut self) -> Option<Self::Item> {
        let value = self.interactions.get_user(self.idx);

        self.idx += 1;

        value
    }
}

/// A training example: `user` with a `target` item and a binary label.
///
/// The history fed to the model is derived from the user's training list
/// when the minibatch is assembled: positives leave their target out,
/// negatives use the full list.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrainingInstance {
    /// The user.
    pub user_id: UserId,
    /// The target item.
    pub item_id: ItemId,
    /// 1.0 for observed interactions, 0.0 for sampled negatives.
    pub label: f32,
}

/// Training instances for one epoch, regenerated by [`TrainingData::shuffle`].
#[derive(Clone, Debug)]
pub struct TrainingData {
    interactions: CompressedInteractions,
    // Sorted copies of each user's items for membership checks.
    seen: Vec<Vec<ItemId>>,
    num_negatives: usize,
    instances: Vec<TrainingInstance>,
}

impl TrainingData {
    /// Build training data with `num_negatives` sampled negatives per
    /// observed interaction. No instances exist until [`TrainingData::shuffle`]
    /// is called.
    pub fn new(interactions: CompressedInteractions, num_negatives: usize) -> Self {
        let seen = interactions
            .iter_users()
            .map(|user| {
                let mut items = user.item_ids.to_owned();
                items.sort_unstable();
                items.dedup();
                items
            })
            .collect();

        TrainingData {
            interactions,
            seen,
            num_negatives,
            instances: Vec::new(),
        }
    }

    /// The per-user training lists.
    pub fn interactions(&self) -> &CompressedInteractions {
        &self.interactions
    }

    /// Index used to pad histories in minibatches.
    pub fn padding_idx(&self) -> ItemId {
        self.interactions.num_items()
    }

    /// Number of instances in the current epoch.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the current epoch has no instances.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// The current epoch's instances, in minibatch order.
    pub fn instances(&self) -> &[TrainingInstance] {
        &self.instances
    }

    /// Whether `user_id` has interacted with `item_id` in the training data.
    pub fn has_seen(&self, user_id: UserId, item_id: ItemId) -> bool {
        self.seen
            .get(user_id)
            .map(|items| items.binary_search(&item_id).is_ok())
            .unwrap_or(false)
    }

    /// Resample negatives and shuffle all instances.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        let num_items = self.interactions.num_items();
        let mut instances =
            Vec::with_capacity(self.interactions.len() * (1 + self.num_negatives));

        if num_items > 0 {
            let item_range = Uniform::new(0, num_items);

            for user in self.interactions.iter_users() {
                let seen = &self.seen[user.user_id];
                // A user who has seen every item has no negatives to draw.
                let can_sample = seen.len() < num_items;

                for &item_id in user.item_ids {
                    instances.push(TrainingInstance {
                        user_id: user.user_id,
                        item_id,
                        label: 1.0,
                    });

                    if !can_sample {
                        continue;
                    }

                    for _ in 0..self.num_negatives {
                        let mut negative = item_range.sample(rng);
                        while seen.binary_search(&negative).is_ok() {
                            negative = item_range.sample(rng);
                        }

                        instances.push(TrainingInstance {
                            user_id: user.user_id,
                            item_id: negative,
                            label: 0.0,
                        });
                    }
                }
            }
        }

        instances.shuffle(rng);
        self.instances = instances;
    }

    /// Number of minibatches per epoch, counting a trailing partial batch.
    pub fn num_minibatches(&self, minibatch_size: usize) -> usize {
        let minibatch_size = minibatch_size.max(1);
        (self.instances.len() + minibatch_size - 1) / minibatch_size
    }

    /// Iterate over padded minibatches of the current epoch.
    ///
    /// The last minibatch may be smaller than `minibatch_size`.
    pub fn iter_minibatch(&self, minibatch_size: usize) -> MinibatchIterator {
        MinibatchIterator {
            data: self,
            idx: 0,
            minibatch_size: minibatch_size.max(1),
        }
    }

    fn history(&self, instance: &TrainingInstance) -> Vec<ItemId> {
        let items = self
            .interactions
            .get_user(instance.user_id)
            .map(|user| user.item_ids)
            .unwrap_or(&[]);

        let mut history = items.to_owned();

        if instance.label > 0.0 {
            if let Some(position) = history.iter().position(|&x| x == instance.item_id) {
                history.remove(position);
            }
        }

        history
    }
}

/// Iterator over the minibatches of a [`TrainingData`] epoch.
pub struct MinibatchIterator<'a> {
    data: &'a TrainingData,
    idx: usize,
    minibatch_size: usize,
}

impl<'a> Iterator for MinibatchIterator<'a> {
    type Item = Minibatch;
    fn next(&mut self) -> Option<Self::Item> {
        let instances = &self.data.instances;

        if self.idx >= instances.len() {
            return None;
        }

        let stop = (self.idx + self.minibatch_size).min(instances.len());
        let mut builder = MinibatchBuilder::new(self.data.padding_idx());

        for instance in &instances[self.idx..stop] {
            builder.push(self.data.history(instance), instance.item_id, instance.label);
        }

        self.idx = stop;

        Some(builder.build())
    }
}

/// Collects examples and pads their histories into a [`Minibatch`].
#[derive(Debug)]
pub struct MinibatchBuilder {
    padding_idx: ItemId,
    histories: Vec<Vec<ItemId>>,
    targets: Vec<ItemId>,
    labels: Vec<f32>,
}

impl MinibatchBuilder {
    /// Start a minibatch padded with `padding_idx`.
    pub fn new(padding_idx: ItemId) -> Self {
        MinibatchBuilder {
            padding_idx,
            histories: Vec::new(),
            targets: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// Add an example.
    pub fn push(&mut self, history: Vec<ItemId>, target: ItemId, label: f32) {
        self.histories.push(history);
        self.targets.push(target);
        self.labels.push(label);
    }

    /// Pad all histories to the longest one.
    pub fn build(self) -> Minibatch {
        let max_length = self.histories.iter().map(|x| x.len()).max().unwrap_or(0);
        let mut histories = vec![self.padding_idx; self.histories.len() * max_length];
        let mut lengths = Vec::with_capacity(self.histories.len());

        for (row, history) in self.histories.iter().enumerate() {
            let start = row * max_length;
            histories[start..start + history.len()].copy_from_slice(history);
            lengths.push(history.len());
        }

        Minibatch {
            max_length,
            histories,
            lengths,
            targets: self.targets,
            labels: self.labels,
        }
    }
}

/// A padded minibatch: histories, their valid lengths, targets and labels.
#[derive(Clone, Debug)]
pub struct Minibatch {
    max_length: usize,
    histories: Vec<ItemId>,
    lengths: Vec<usize>,
    targets: Vec<ItemId>,
    labels: Vec<f32>,
}

impl Minibatch {
    /// Build a minibatch scoring `candidates` against a single history.
    pub fn for_candidates(
        history: &[ItemId],
        candidates: &[ItemId],
        labels: &[f32],
        padding_idx: ItemId,
    ) -> Self {
        let mut builder = MinibatchBuilder::new(padding_idx);

        for (&candidate, &label) in candidates.iter().zip(labels) {
            builder.push(history.to_owned(), candidate, label);
        }

        builder.build()
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the minibatch is empty.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Length every history is padded to.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// The valid (unpadded) history of example `idx`.
    pub fn history(&self, idx: usize) -> &[ItemId] {
        let start = idx * self.max_length;
        &self.histories[start..start + self.lengths[idx]]
    }

    /// The padded history of example `idx`.
    pub fn padded_history(&self, idx: usize) -> &[ItemId] {
        let start = idx * self.max_length;
        &self.histories[start..start + self.max_length]
    }

    /// Number of valid history entries per example.
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Target items.
    pub fn targets(&self) -> &[ItemId] {
        &self.targets
    }

    /// Binary labels.
    pub fn labels(&self) -> &[f32] {
        &self.labels
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    use super::*;

    fn interactions() -> Interactions {
        Interactions::from(vec![
            Interaction::new(1, 3),
            Interaction::new(0, 2),
            Interaction::new(1, 0),
            Interaction::new(0, 5),
            Interaction::new(0, 1),
            Interaction::new(2, 4),
        ])
    }

    #[test]
    fn compressed_keeps_file_order() {
        let compressed = interactions().to_compressed();

        assert_eq!(compressed.shape(), (3, 6));
        assert_eq!(compressed.get_user(0).unwrap().item_ids, &[2, 5, 1]);
        assert_eq!(compressed.get_user(1).unwrap().item_ids, &[3, 0]);
        assert_eq!(compressed.get_user(2).unwrap().item_ids, &[4]);
        assert!(compressed.get_user(3).is_none());
        assert_eq!(compressed.iter_users().count(), 3);
    }

    #[test]
    fn negatives_are_unseen() {
        let mut rng = XorShiftRng::seed_from_u64(7);
        let mut data = TrainingData::new(interactions().to_compressed(), 4);

        data.shuffle(&mut rng);

        assert_eq!(data.len(), 6 * 5);
        assert_eq!(
            data.instances().iter().filter(|x| x.label > 0.0).count(),
            6
        );

        for instance in data.instances() {
            let seen = data.has_seen(instance.user_id, instance.item_id);
            assert_eq!(seen, instance.label > 0.0);
        }
    }

    #[test]
    fn user_with_every_item_gets_no_negatives() {
        let mut rng = XorShiftRng::seed_from_u64(7);
        let data = Interactions::from(vec![Interaction::new(0, 0), Interaction::new(0, 1)]);
        let mut data = TrainingData::new(data.to_compressed(), 3);

        data.shuffle(&mut rng);

        assert_eq!(data.len(), 2);
    }

    #[test]
    fn minibatches_are_padded() {
        let mut rng = XorShiftRng::seed_from_u64(11);
        let mut data = TrainingData::new(interactions().to_compressed(), 1);
        data.shuffle(&mut rng);

        let batches: Vec<_> = data.iter_minibatch(5).collect();

        assert_eq!(batches.len(), data.num_minibatches(5));
        assert_eq!(batches.iter().map(|x| x.len()).sum::<usize>(), data.len());
        assert_eq!(batches.last().unwrap().len(), 2);

        for batch in &batches {
            for idx in 0..batch.len() {
                let padded = batch.padded_history(idx);
                let length = batch.lengths()[idx];

                assert_eq!(padded.len(), batch.max_length());
                assert!(padded[length..].iter().all(|&x| x == data.padding_idx()));
                assert!(batch.history(idx).iter().all(|&x| x < data.padding_idx()));
            }
        }
    }

    #[test]
    fn positives_leave_out_their_target() {
        let mut rng = XorShiftRng::seed_from_u64(3);
        let mut data = TrainingData::new(interactions().to_compressed(), 2);
        data.shuffle(&mut rng);

        for batch in data.iter_minibatch(4) {
            for idx in 0..batch.len() {
                let history = batch.history(idx);
                let target = batch.targets()[idx];

                if batch.labels()[idx] > 0.0 {
                    assert!(!history.contains(&target));
                } else {
                    assert!(!history.is_empty());
                }
            }
        }
    }

    #[test]
    fn candidate_minibatch() {
        let batch = Minibatch::for_candidates(&[1, 2], &[3, 4, 5], &[0.0, 0.0, 1.0], 9);

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.history(2), &[1, 2]);
        assert_eq!(batch.targets(), &[3, 4, 5]);
        assert_eq!(batch.labels(), &[0.0, 0.0, 1.0]);
    }
}
