//! Dataset loading.
//!
//! A dataset named `prefix` consists of three tab-separated files:
//!
//! - `prefix.train.rating`: `user item rating timestamp` per line,
//! - `prefix.test.rating`: one held-out `user item ...` line per test case,
//! - `prefix.test.negative`: `(user,item)` followed by the negative items
//!   of the test case on the same line of `prefix.test.rating`.
use std::path::{Path, PathBuf};

use csv;
use failure;
use rand::distributions::{Distribution, Uniform};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::data::{Interaction, Interactions, TestCase};
use crate::{ItemId, UserId};

/// Dataset error types.
#[derive(Debug, Fail)]
pub enum DatasetError {
    /// A dataset file does not exist.
    #[fail(display = "Dataset file {:?} not found.", path)]
    MissingFile {
        /// The missing file.
        path: PathBuf,
    },
    /// A line could not be parsed.
    #[fail(display = "Malformed line {} of {:?}: {}", line, path, reason)]
    MalformedLine {
        /// The offending file.
        path: PathBuf,
        /// 1-based line number.
        line: u64,
        /// What was wrong.
        reason: String,
    },
    /// The test and negative files disagree.
    #[fail(display = "Test files disagree: {}", reason)]
    Inconsistent {
        /// What was wrong.
        reason: String,
    },
}

/// A training set with held-out test cases.
#[derive(Clone, Debug)]
pub struct Dataset {
    /// Training interactions, in file order.
    pub train: Interactions,
    /// Held-out test cases.
    pub test: Vec<TestCase>,
}

impl Dataset {
    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.train.num_users()
    }

    /// Number of items, covering train, test and negative item ids.
    pub fn num_items(&self) -> usize {
        self.train.num_items()
    }
}

fn reader(path: &Path) -> Result<csv::Reader<std::fs::File>, failure::Error> {
    if !path.exists() {
        return Err(DatasetError::MissingFile {
            path: path.to_path_buf(),
        }
        .into());
    }

    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_path(path)?)
}

fn malformed(path: &Path, record: &csv::StringRecord, reason: &str) -> DatasetError {
    DatasetError::MalformedLine {
        path: path.to_path_buf(),
        line: record.position().map(|x| x.line()).unwrap_or(0),
        reason: reason.to_owned(),
    }
}

fn parse_id(path: &Path, record: &csv::StringRecord, idx: usize) -> Result<usize, DatasetError> {
    record
        .get(idx)
        .ok_or_else(|| malformed(path, record, &format!("missing field {}", idx)))?
        .trim()
        .parse()
        .map_err(|_| malformed(path, record, &format!("field {} is not an id", idx)))
}

fn load_ratings(path: &Path) -> Result<Vec<(UserId, ItemId)>, failure::Error> {
    let mut ratings = Vec::new();

    for record in reader(path)?.records() {
        let record = record?;
        ratings.push((parse_id(path, &record, 0)?, parse_id(path, &record, 1)?));
    }

    Ok(ratings)
}

fn parse_pair(path: &Path, record: &csv::StringRecord) -> Result<(UserId, ItemId), DatasetError> {
    let field = record.get(0).unwrap_or("");
    let invalid = || malformed(path, record, "expected (user,item) in the first field");

    let inner = field
        .trim()
        .strip_prefix('(')
        .and_then(|x| x.strip_suffix(')'))
        .ok_or_else(invalid)?;

    let mut parts = inner.split(',').map(|x| x.trim().parse::<usize>());

    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(user_id)), Some(Ok(item_id)), None) => Ok((user_id, item_id)),
        _ => Err(invalid()),
    }
}

fn load_negatives(path: &Path) -> Result<Vec<(UserId, ItemId, Vec<ItemId>)>, failure::Error> {
    let mut rows = Vec::new();

    for record in reader(path)?.records() {
        let record = record?;
        let (user_id, item_id) = parse_pair(path, &record)?;
        let negatives = (1..record.len())
            .filter(|&idx| !record[idx].trim().is_empty())
            .map(|idx| parse_id(path, &record, idx))
            .collect::<Result<Vec<_>, _>>()?;

        rows.push((user_id, item_id, negatives));
    }

    Ok(rows)
}

/// Load the dataset whose files start with `prefix`.
pub fn load<P: AsRef<Path>>(prefix: P) -> Result<Dataset, failure::Error> {
    let prefix = prefix.as_ref().to_string_lossy().into_owned();
    let train_path = PathBuf::from(format!("{}.train.rating", prefix));
    let test_path = PathBuf::from(format!("{}.test.rating", prefix));
    let negative_path = PathBuf::from(format!("{}.test.negative", prefix));

    let train = load_ratings(&train_path)?;
    let test = load_ratings(&test_path)?;
    let negatives = load_negatives(&negative_path)?;

    if test.len() != negatives.len() {
        return Err(DatasetError::Inconsistent {
            reason: format!(
                "{} test ratings but {} negative lists",
                test.len(),
                negatives.len()
            ),
        }
        .into());
    }

    let mut interactions = Interactions::from(
        train
            .into_iter()
            .map(|(user_id, item_id)| Interaction::new(user_id, item_id))
            .collect::<Vec<_>>(),
    );

    let mut test_cases = Vec::with_capacity(test.len());

    for (line, ((user_id, item_id), (neg_user_id, neg_item_id, negatives))) in
        test.into_iter().zip(negatives).enumerate()
    {
        if (user_id, item_id) != (neg_user_id, neg_item_id) {
            return Err(DatasetError::Inconsistent {
                reason: format!(
                    "line {}: test rating ({},{}) but negatives for ({},{})",
                    line + 1,
                    user_id,
                    item_id,
                    neg_user_id,
                    neg_item_id
                ),
            }
            .into());
        }

        let max_item = negatives.iter().cloned().chain(Some(item_id)).max().unwrap_or(0);
        interactions.reshape(user_id + 1, max_item + 1);

        test_cases.push(TestCase {
            user_id,
            item_id,
            negatives,
        });
    }

    info!(
        prefix = %prefix,
        users = interactions.num_users(),
        items = interactions.num_items(),
        train = interactions.len(),
        test = test_cases.len(),
        "loaded dataset"
    );

    Ok(Dataset {
        train: interactions,
        test: test_cases,
    })
}

/// Generate a clustered toy dataset.
///
/// Items are split into `num_clusters` contiguous groups and every user
/// draws `items_per_user + 1` distinct items from one group; the last one is
/// held out for testing and ranked against `num_negatives` items the user
/// never interacted with. Useful for tests and benchmarks.
pub fn synthetic<R: Rng>(
    num_users: usize,
    num_items: usize,
    num_clusters: usize,
    items_per_user: usize,
    num_negatives: usize,
    rng: &mut R,
) -> Dataset {
    let num_clusters = num_clusters.max(1);
    let cluster_size = num_items / num_clusters;

    let mut train = Interactions::new(num_users, num_items);
    let mut test = Vec::with_capacity(num_users);

    for user_id in 0..num_users {
        let cluster = user_id % num_clusters;
        let members: Vec<ItemId> = (cluster * cluster_size..(cluster + 1) * cluster_size).collect();
        let chosen: Vec<ItemId> = members
            .choose_multiple(rng, (items_per_user + 1).min(members.len()))
            .cloned()
            .collect();

        let (held_out, history) = match chosen.split_last() {
            Some((&held_out, history)) => (held_out, history),
            None => continue,
        };

        for &item_id in history {
            train.push(Interaction::new(user_id, item_id));
        }

        let mut negatives = Vec::with_capacity(num_negatives);
        if chosen.len() < num_items {
            let item_range = Uniform::new(0, num_items);
            while negatives.len() < num_negatives {
                let item_id = item_range.sample(rng);
                if !chosen.contains(&item_id) {
                    negatives.push(item_id);
                }
            }
        }

        test.push(TestCase {
            user_id,
            item_id: held_out,
            negatives,
        });
    }

    Dataset { train, test }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;
    use tempfile::TempDir;

    use super::*;

    fn write_dataset(dir: &Path, negatives: &str) -> PathBuf {
        let prefix = dir.join("toy");
        fs::write(
            dir.join("toy.train.rating"),
            "0\t1\t1\t100\n0\t3\t1\t101\n1\t2\t1\t102\n1\t0\t1\t103\n1\t4\t1\t104\n",
        )
        .unwrap();
        fs::write(dir.join("toy.test.rating"), "0\t5\t1\t105\n1\t1\t1\t106\n").unwrap();
        fs::write(dir.join("toy.test.negative"), negatives).unwrap();

        prefix
    }

    #[test]
    fn loads_all_files() {
        let dir = TempDir::new().unwrap();
        let prefix = write_dataset(dir.path(), "(0,5)\t0\t2\t7\n(1,1)\t3\t5\n");

        let dataset = load(&prefix).unwrap();
        let train = dataset.train.to_compressed();

        assert_eq!(dataset.num_users(), 2);
        // Negative item 7 widens the item range.
        assert_eq!(dataset.num_items(), 8);
        assert_eq!(train.get_user(0).unwrap().item_ids, &[1, 3]);
        assert_eq!(train.get_user(1).unwrap().item_ids, &[2, 0, 4]);
        assert_eq!(
            dataset.test,
            vec![
                TestCase {
                    user_id: 0,
                    item_id: 5,
                    negatives: vec![0, 2, 7],
                },
                TestCase {
                    user_id: 1,
                    item_id: 1,
                    negatives: vec![3, 5],
                },
            ]
        );
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let error = load(dir.path().join("absent")).unwrap_err();

        match error.downcast_ref::<DatasetError>() {
            Some(DatasetError::MissingFile { .. }) => {}
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn malformed_negatives_are_rejected() {
        let dir = TempDir::new().unwrap();
        let prefix = write_dataset(dir.path(), "0,5\t0\t2\n(1,1)\t3\t5\n");

        let error = load(&prefix).unwrap_err();

        match error.downcast_ref::<DatasetError>() {
            Some(DatasetError::MalformedLine { line, .. }) => assert_eq!(*line, 1),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn mismatched_negatives_are_rejected() {
        let dir = TempDir::new().unwrap();
        let prefix = write_dataset(dir.path(), "(1,1)\t3\t5\n(0,5)\t0\t2\n");

        assert!(load(&prefix).is_err());
    }

    #[test]
    fn synthetic_dataset_shape() {
        let mut rng = XorShiftRng::seed_from_u64(5);
        let dataset = synthetic(12, 30, 3, 4, 6, &mut rng);
        let train = dataset.train.to_compressed();

        assert_eq!(dataset.num_users(), 12);
        assert_eq!(dataset.num_items(), 30);
        assert_eq!(dataset.train.len(), 12 * 4);
        assert_eq!(dataset.test.len(), 12);

        for case in &dataset.test {
            let history = train.get_user(case.user_id).unwrap().item_ids;
            let cluster = case.user_id % 3;

            assert_eq!(case.negatives.len(), 6);
            assert!(!history.contains(&case.item_id));
            assert!(history.iter().all(|&x| x / 10 == cluster));
            assert!(case.negatives.iter().all(|x| !history.contains(x)));
            assert!(!case.negatives.contains(&case.item_id));
        }
    }
}
