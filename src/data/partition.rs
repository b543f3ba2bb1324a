use std::{collections::BTreeMap, sync::Arc};

use rand::{seq::SliceRandom, Rng};

use super::{DataError, Dataset, Result, Subset};

/// Cuts one label's shuffled sample pool into `shards` contiguous pieces.
///
/// The leading `pool.len() % shards` pieces hold one sample more than the rest,
/// so a label with fewer samples than shards leaves trailing pieces empty.
pub fn split_label_pool(pool: &[usize], shards: usize) -> Vec<Vec<usize>> {
    let (base, extra) = (pool.len() / shards, pool.len() % shards);
    let mut rest = pool;

    (0..shards)
        .map(|i| {
            let (piece, tail) = rest.split_at(base + usize::from(i < extra));
            rest = tail;
            piece.to_vec()
        })
        .collect()
}

/// A slice of one label's shuffled index pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    label: usize,
    indices: Vec<usize>,
}

impl Shard {
    #[inline]
    pub fn label(&self) -> usize {
        self.label
    }

    #[inline]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// The disjoint, fully-covering assignment of shards to participants.
#[derive(Debug, Clone)]
pub struct Partition {
    clients: Vec<Vec<Shard>>,
    shards_per_client: usize,
}

impl Partition {
    #[inline]
    pub fn num_participants(&self) -> usize {
        self.clients.len()
    }

    #[inline]
    pub fn shards_per_client(&self) -> usize {
        self.shards_per_client
    }

    /// The shards dealt to participant `id` (panics if out of range).
    #[inline]
    pub fn shards(&self, id: usize) -> &[Shard] {
        &self.clients[id]
    }

    /// The concatenated dataset indices of participant `id`.
    pub fn indices(&self, id: usize) -> Vec<usize> {
        self.clients[id]
            .iter()
            .flat_map(|shard| shard.indices.iter().copied())
            .collect()
    }

    /// The number of samples held by participant `id`.
    pub fn len_of(&self, id: usize) -> usize {
        self.clients[id].iter().map(Shard::len).sum()
    }

    /// Binds participant `id`'s indices to `dataset`.
    pub fn subset(&self, id: usize, dataset: Arc<Dataset>) -> Subset {
        Subset::new(dataset, self.indices(id))
    }

    /// Per-label sample counts of participant `id`, skipping empty shards.
    pub fn label_counts(&self, id: usize) -> BTreeMap<usize, usize> {
        let mut counts = BTreeMap::new();
        for shard in self.clients[id].iter().filter(|s| !s.is_empty()) {
            *counts.entry(shard.label).or_insert(0) += shard.len();
        }
        counts
    }
}

/// Partitions `dataset` into `num_participants` skewed, disjoint shards sets.
///
/// Every label's index pool is shuffled and split into `shards_per_label` near-equal
/// shards, the resulting `C * K` shards are shuffled together and then dealt
/// `C * K / N` at a time to each participant.
///
/// # Args
/// * `dataset` - The labeled dataset to split.
/// * `num_participants` - The amount of participants `N`.
/// * `shards_per_label` - The amount of shards `K` each label is split into.
/// * `rng` - The random source used for every shuffle.
///
/// # Errors
/// `DataError::Configuration` if `N` or `K` is zero or if `C * K` isn't a multiple of `N`.
pub fn partition<R: Rng + ?Sized>(
    dataset: &Dataset,
    num_participants: usize,
    shards_per_label: usize,
    rng: &mut R,
) -> Result<Partition> {
    if num_participants == 0 {
        return Err(DataError::Configuration(
            "the number of participants must be greater than zero".into(),
        ));
    }

    if shards_per_label == 0 {
        return Err(DataError::Configuration(
            "the number of shards per label must be greater than zero".into(),
        ));
    }

    let total_shards = dataset.num_classes() * shards_per_label;
    if total_shards % num_participants != 0 {
        return Err(DataError::Configuration(format!(
            "{total_shards} shards ({} labels x {shards_per_label}) can't be dealt evenly to {num_participants} participants",
            dataset.num_classes()
        )));
    }

    let shards_per_client = total_shards / num_participants;

    let mut pool = Vec::with_capacity(total_shards);
    for (label, mut indices) in dataset.indices_by_label().into_iter().enumerate() {
        indices.shuffle(rng);

        pool.extend(
            split_label_pool(&indices, shards_per_label)
                .into_iter()
                .map(|indices| Shard { label, indices }),
        );
    }

    pool.shuffle(rng);

    let mut clients = Vec::with_capacity(num_participants);
    while !pool.is_empty() {
        let at = pool.len() - shards_per_client;
        clients.push(pool.split_off(at));
    }

    Ok(Partition {
        clients,
        shards_per_client,
    })
}
