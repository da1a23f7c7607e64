//! 模块家族：同名模块的修订历史

use std::sync::Arc;

use super::info::ModuleInfo;
use super::revision::ModuleRevision;

/// 同一模块名下按修订号升序排列的修订序列
///
/// 最后一个元素即当前修订。家族自身不加锁，只在注册表的锁内访问。
#[derive(Debug)]
pub struct ModuleFamily {
    name: String,
    revisions: Vec<Arc<ModuleRevision>>,
    pending_removal: bool,
}

impl ModuleFamily {
    /// 创建空家族
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revisions: Vec::new(),
            pending_removal: false,
        }
    }

    /// 模块名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 添加修订
    ///
    /// 同一标识的修订只会添加一次。按修订号有序插入，正常部署时等同于追加。
    /// 返回是否实际添加。
    pub fn add_revision(&mut self, revision: Arc<ModuleRevision>) -> bool {
        if self.revisions.iter().any(|r| r.same_identity(&revision)) {
            return false;
        }
        let position = self
            .revisions
            .partition_point(|r| r.revision() < revision.revision());
        self.revisions.insert(position, revision);
        true
    }

    /// 移除修订，返回是否找到
    pub fn remove_revision(&mut self, revision: &ModuleRevision) -> bool {
        let before = self.revisions.len();
        self.revisions.retain(|r| !r.same_identity(revision));
        self.revisions.len() != before
    }

    /// 当前修订
    pub fn current(&self) -> Option<&Arc<ModuleRevision>> {
        self.revisions.last()
    }

    /// 全部修订
    pub fn all(&self) -> &[Arc<ModuleRevision>] {
        &self.revisions
    }

    /// 按修订号查找
    pub fn find(&self, revision: i64) -> Option<&Arc<ModuleRevision>> {
        self.revisions.iter().find(|r| r.revision() == revision)
    }

    /// 已登记的修订号
    pub fn revision_numbers(&self) -> Vec<i64> {
        self.revisions.iter().map(|r| r.revision()).collect()
    }

    /// 全部修订的信息快照
    pub fn info_snapshot(&self) -> Vec<ModuleInfo> {
        self.revisions.iter().map(|r| r.info()).collect()
    }

    /// 标记（或取消标记）整个家族待删除
    pub fn mark_pending_removal(&mut self, pending: bool) {
        self.pending_removal = pending;
    }

    /// 是否待删除
    pub fn is_pending_removal(&self) -> bool {
        self.pending_removal
    }

    /// 是否没有任何修订
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// 修订数
    pub fn len(&self) -> usize {
        self.revisions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn revision(number: i64) -> Arc<ModuleRevision> {
        ModuleRevision::unloaded(ModuleInfo::new("Greeter", None, None, number, Utc::now()))
    }

    #[test]
    fn test_current_is_latest() {
        let mut family = ModuleFamily::new("Greeter");
        assert!(family.current().is_none());
        assert!(family.is_empty());

        family.add_revision(revision(0));
        family.add_revision(revision(1));
        assert_eq!(family.current().unwrap().revision(), 1);
        assert_eq!(family.len(), 2);
    }

    #[test]
    fn test_add_is_idempotent_by_identity() {
        let mut family = ModuleFamily::new("Greeter");
        assert!(family.add_revision(revision(0)));
        assert!(!family.add_revision(revision(0)));
        assert_eq!(family.revision_numbers(), vec![0]);
    }

    #[test]
    fn test_out_of_order_insert_keeps_order() {
        let mut family = ModuleFamily::new("Greeter");
        family.add_revision(revision(2));
        family.add_revision(revision(0));
        family.add_revision(revision(1));
        assert_eq!(family.revision_numbers(), vec![0, 1, 2]);
        assert_eq!(family.current().unwrap().revision(), 2);
    }

    #[test]
    fn test_remove_revision() {
        let mut family = ModuleFamily::new("Greeter");
        let first = revision(0);
        family.add_revision(first.clone());
        family.add_revision(revision(1));

        assert!(family.remove_revision(&first));
        assert!(!family.remove_revision(&first));
        assert_eq!(family.revision_numbers(), vec![1]);
        assert!(family.find(0).is_none());
        assert!(family.find(1).is_some());
    }

    #[test]
    fn test_snapshot_and_pending_flag() {
        let mut family = ModuleFamily::new("Greeter");
        family.add_revision(revision(0));
        family.add_revision(revision(1));

        let snapshot = family.info_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].revision, 1);

        assert!(!family.is_pending_removal());
        family.mark_pending_removal(true);
        assert!(family.is_pending_removal());
    }
}
