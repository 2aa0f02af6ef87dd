//! TaskBalancer - ワーカーへのタスク割り当て
//!
//! # 設計原則
//! - 差分更新はしない。`balance()` のたびに全体を貪欲に再計算する
//!   （トポロジ変化は定常運用に比べて稀なので、ドリフトしない単純さを取る）
//! - `balance()` は 1 回の呼び出しで完結する。途中状態は外から見えない
//! - 割り当てが変わったタスクは `Assignment` として返す。通知は呼び出し側の責務
//!
//! # 不変条件
//! - Σ(各ワーカーのタスク数) + orphan 数 == total
//! - 1 つのタスクは高々 1 つのリストにしか存在しない

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalancerError {
    #[error("task {0} is already balanced")]
    DuplicateTask(String),

    #[error("worker {0} is already registered")]
    DuplicateWorker(String),

    #[error("worker {0} is not registered")]
    UnknownWorker(String),
}

/// A task's (new) worker. `None` means "no worker, sit tight".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment<T, W> {
    pub task: T,
    pub worker: Option<W>,
}

#[derive(Debug)]
struct Slot<T, W> {
    worker: W,
    capacity: usize,
    tasks: Vec<T>,
}

#[derive(Debug)]
pub struct TaskBalancer<T, W> {
    /// Insertion order breaks every tie.
    slots: Vec<Slot<T, W>>,
    orphans: Vec<T>,
}

impl<T, W> Default for TaskBalancer<T, W> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            orphans: Vec::new(),
        }
    }
}

impl<T, W> TaskBalancer<T, W>
where
    T: Clone + Eq + Hash + Debug,
    W: Clone + Eq + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Workers
    // =========================================================================

    pub fn add_worker(&mut self, worker: W, capacity: usize) -> Result<(), BalancerError> {
        if self.slot_index(&worker).is_some() {
            return Err(BalancerError::DuplicateWorker(format!("{worker:?}")));
        }
        self.slots.push(Slot {
            worker,
            capacity,
            tasks: Vec::new(),
        });
        Ok(())
    }

    /// Tasks of the removed worker become orphans. Returns `false` when unknown.
    pub fn remove_worker(&mut self, worker: &W) -> bool {
        let Some(idx) = self.slot_index(worker) else {
            return false;
        };
        let slot = self.slots.remove(idx);
        self.orphans.extend(slot.tasks);
        true
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// With a worker the task is placed directly and its assignment returned;
    /// without one it joins the orphans silently.
    pub fn add_task(
        &mut self,
        task: T,
        worker: Option<W>,
    ) -> Result<Option<Assignment<T, W>>, BalancerError> {
        if self.contains_task(&task) {
            return Err(BalancerError::DuplicateTask(format!("{task:?}")));
        }
        match worker {
            None => {
                self.orphans.push(task);
                Ok(None)
            }
            Some(worker) => {
                let idx = self
                    .slot_index(&worker)
                    .ok_or_else(|| BalancerError::UnknownWorker(format!("{worker:?}")))?;
                self.slots[idx].tasks.push(task.clone());
                Ok(Some(Assignment {
                    task,
                    worker: Some(worker),
                }))
            }
        }
    }

    pub fn remove_task(&mut self, task: &T) -> bool {
        if let Some(pos) = self.orphans.iter().position(|t| t == task) {
            self.orphans.remove(pos);
            return true;
        }
        for slot in &mut self.slots {
            if let Some(pos) = slot.tasks.iter().position(|t| t == task) {
                slot.tasks.remove(pos);
                return true;
            }
        }
        false
    }

    // =========================================================================
    // Balance
    // =========================================================================

    /// Full greedy recompute.
    ///
    /// 1. 容量で頭打ちにしながら total を水位で配る（容量が効かなければ ceil(total/n) と同じ）
    /// 2. 目標を超えたワーカーは末尾から orphan へ
    /// 3. 負荷の低いワーカーから順に orphan の末尾を引き取る
    ///
    /// Returns every task whose worker changed plus every task left orphaned
    /// (with `None`).
    pub fn balance(&mut self) -> Vec<Assignment<T, W>> {
        let targets = self.targets();

        let mut origin: HashMap<T, W> = HashMap::new();
        for (slot, target) in self.slots.iter_mut().zip(&targets) {
            while slot.tasks.len() > *target {
                if let Some(task) = slot.tasks.pop() {
                    origin.insert(task.clone(), slot.worker.clone());
                    self.orphans.push(task);
                }
            }
        }

        let mut order: Vec<usize> = (0..self.slots.len()).collect();
        order.sort_by_key(|&i| self.slots[i].tasks.len());

        let mut changed = Vec::new();
        for i in order {
            let slot = &mut self.slots[i];
            while slot.tasks.len() < targets[i] {
                let Some(task) = self.orphans.pop() else {
                    break;
                };
                if origin.get(&task) != Some(&slot.worker) {
                    changed.push(Assignment {
                        task: task.clone(),
                        worker: Some(slot.worker.clone()),
                    });
                }
                slot.tasks.push(task);
            }
        }

        changed.extend(self.orphans.iter().map(|task| Assignment {
            task: task.clone(),
            worker: None,
        }));
        changed
    }

    /// Per-worker target load (water-filling bounded by capacity).
    fn targets(&self) -> Vec<usize> {
        let mut targets = vec![0; self.slots.len()];
        let mut remaining = self.total().min(self.capacity());
        let mut open: Vec<usize> = (0..self.slots.len())
            .filter(|&i| self.slots[i].capacity > 0)
            .collect();

        while remaining > 0 && !open.is_empty() {
            let share = remaining / open.len();
            let (capped, rest): (Vec<usize>, Vec<usize>) = open
                .iter()
                .partition(|&&i| self.slots[i].capacity <= share);

            if capped.is_empty() {
                for &i in &rest {
                    targets[i] = share;
                }
                // 端数は今いちばん負荷の高いワーカーへ（移動を最小にする）
                let mut by_load = rest.clone();
                by_load.sort_by(|&a, &b| self.slots[b].tasks.len().cmp(&self.slots[a].tasks.len()));
                for &i in by_load.iter().take(remaining % rest.len()) {
                    targets[i] += 1;
                }
                break;
            }

            for &i in &capped {
                targets[i] = self.slots[i].capacity;
                remaining -= self.slots[i].capacity;
            }
            open = rest;
        }
        targets
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn total(&self) -> usize {
        self.orphans.len() + self.slots.iter().map(|s| s.tasks.len()).sum::<usize>()
    }

    pub fn capacity(&self) -> usize {
        self.slots.iter().map(|s| s.capacity).sum()
    }

    pub fn worker_count(&self) -> usize {
        self.slots.len()
    }

    pub fn contains_task(&self, task: &T) -> bool {
        self.orphans.contains(task) || self.slots.iter().any(|s| s.tasks.contains(task))
    }

    pub fn worker_of(&self, task: &T) -> Option<&W> {
        self.slots
            .iter()
            .find(|s| s.tasks.contains(task))
            .map(|s| &s.worker)
    }

    pub fn tasks_of(&self, worker: &W) -> &[T] {
        self.slot_index(worker)
            .map(|i| self.slots[i].tasks.as_slice())
            .unwrap_or(&[])
    }

    pub fn orphans(&self) -> &[T] {
        &self.orphans
    }

    /// (worker, load, capacity) in insertion order.
    pub fn loads(&self) -> Vec<(W, usize, usize)> {
        self.slots
            .iter()
            .map(|s| (s.worker.clone(), s.tasks.len(), s.capacity))
            .collect()
    }

    fn slot_index(&self, worker: &W) -> Option<usize> {
        self.slots.iter().position(|s| &s.worker == worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;

    type Balancer = TaskBalancer<u32, &'static str>;

    fn assert_conserved(b: &Balancer, expected_total: usize) {
        let placed: usize = b.loads().iter().map(|(_, load, _)| load).sum();
        assert_eq!(placed + b.orphans().len(), expected_total);
        assert_eq!(b.total(), expected_total);
    }

    #[test]
    fn capacity_leaves_one_orphan_with_no_worker() {
        let mut b = Balancer::new();
        b.add_worker("w1", 2).unwrap();
        for t in 1..=3 {
            assert_eq!(b.add_task(t, None).unwrap(), None);
        }

        let assignments = b.balance();

        assert_eq!(b.tasks_of(&"w1").len(), 2);
        assert_eq!(b.orphans().len(), 1);
        let orphan = b.orphans()[0];
        assert!(assignments.contains(&Assignment {
            task: orphan,
            worker: None
        }));
        assert_eq!(
            assignments.iter().filter(|a| a.worker == Some("w1")).count(),
            2
        );
    }

    #[test]
    fn no_workers_reports_every_orphan() {
        let mut b = Balancer::new();
        b.add_task(1, None).unwrap();
        b.add_task(2, None).unwrap();

        let assignments = b.balance();

        assert_eq!(assignments.len(), 2);
        assert!(assignments.iter().all(|a| a.worker.is_none()));
    }

    #[test]
    fn direct_assignment_bypasses_balance() {
        let mut b = Balancer::new();
        b.add_worker("w1", 1).unwrap();
        let a = b.add_task(7, Some("w1")).unwrap();
        assert_eq!(
            a,
            Some(Assignment {
                task: 7,
                worker: Some("w1")
            })
        );
        assert_eq!(b.worker_of(&7), Some(&"w1"));
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut b = Balancer::new();
        b.add_worker("w1", 1).unwrap();
        b.add_task(1, None).unwrap();
        assert!(matches!(
            b.add_task(1, Some("w1")),
            Err(BalancerError::DuplicateTask(_))
        ));
        assert!(matches!(
            b.add_worker("w1", 3),
            Err(BalancerError::DuplicateWorker(_))
        ));
        assert!(matches!(
            b.add_task(2, Some("w9")),
            Err(BalancerError::UnknownWorker(_))
        ));
    }

    #[test]
    fn removing_a_worker_orphans_its_tasks() {
        let mut b = Balancer::new();
        b.add_worker("w1", 4).unwrap();
        b.add_worker("w2", 4).unwrap();
        for t in 0..4 {
            b.add_task(t, None).unwrap();
        }
        b.balance();
        let moved = b.tasks_of(&"w1").to_vec();

        assert!(b.remove_worker(&"w1"));
        assert_eq!(b.orphans(), moved.as_slice());

        let assignments = b.balance();
        assert_eq!(b.tasks_of(&"w2").len(), 4);
        assert!(b.orphans().is_empty());
        // w2 の既存タスクは動かない
        assert_eq!(assignments.len(), moved.len());
    }

    #[test]
    fn stable_table_reports_nothing() {
        let mut b = Balancer::new();
        b.add_worker("w1", 5).unwrap();
        b.add_worker("w2", 5).unwrap();
        for t in 0..5 {
            b.add_task(t, None).unwrap();
        }
        b.balance();
        assert!(b.balance().is_empty());
    }

    #[test]
    fn shed_task_moves_to_the_new_worker() {
        let mut b = Balancer::new();
        b.add_worker("w1", 10).unwrap();
        for t in 0..4 {
            b.add_task(t, Some("w1")).unwrap();
        }
        b.add_worker("w2", 10).unwrap();

        let assignments = b.balance();

        assert_eq!(b.tasks_of(&"w1").len(), 2);
        assert_eq!(b.tasks_of(&"w2").len(), 2);
        assert_eq!(assignments.len(), 2);
        assert!(assignments.iter().all(|a| a.worker == Some("w2")));
    }

    #[rstest]
    #[case(&[3, 3], 5, &[3, 2])]
    #[case(&[1, 10], 8, &[1, 7])]
    #[case(&[0, 2], 4, &[0, 2])]
    #[case(&[4, 4, 4], 7, &[3, 2, 2])]
    fn water_filling_respects_capacity(
        #[case] capacities: &[usize],
        #[case] tasks: u32,
        #[case] expected: &[usize],
    ) {
        let names = ["a", "b", "c"];
        let mut b = Balancer::new();
        for (name, cap) in names.iter().zip(capacities) {
            b.add_worker(*name, *cap).unwrap();
        }
        for t in 0..tasks {
            b.add_task(t, None).unwrap();
        }
        b.balance();

        let loads: Vec<usize> = b.loads().iter().map(|(_, load, _)| *load).collect();
        assert_eq!(loads, expected);
        assert_conserved(&b, tasks as usize);
    }

    #[test]
    fn random_operations_converge_and_conserve() {
        let workers = ["w1", "w2", "w3", "w4"];
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut b = Balancer::new();
        let mut live: Vec<u32> = Vec::new();
        let mut next = 0;

        for _ in 0..500 {
            match rng.gen_range(0..5) {
                0 => {
                    let w = workers[rng.gen_range(0..workers.len())];
                    let _ = b.add_worker(w, 100);
                }
                1 => {
                    let w = workers[rng.gen_range(0..workers.len())];
                    b.remove_worker(&w);
                }
                2 | 3 => {
                    b.add_task(next, None).unwrap();
                    live.push(next);
                    next += 1;
                }
                _ => {
                    if !live.is_empty() {
                        let t = live.swap_remove(rng.gen_range(0..live.len()));
                        assert!(b.remove_task(&t));
                    }
                }
            }
            assert_conserved(&b, live.len());

            b.balance();
            assert_conserved(&b, live.len());
            let loads: Vec<usize> = b.loads().iter().map(|(_, load, _)| *load).collect();
            if let (Some(max), Some(min)) = (loads.iter().max(), loads.iter().min()) {
                assert!(max - min <= 1, "unbalanced loads {loads:?}");
            }
            assert_eq!(b.orphans().is_empty(), live.len() <= b.capacity());
        }
    }
}
