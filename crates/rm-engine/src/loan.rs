//! Loans: rights on deposit between two owners

use crate::remote::Remote;
use rm_core::{GroupId, LoanCookie, Right};
use std::sync::Arc;

/// A right lent across an owner boundary.
///
/// The same cookie names the loan on the creditor's `sublet` list and on the
/// debtor's `borrowed` list. A loan without a remote is the self-loan that
/// seeds a top-most owner. Loans of one credit group may lend the same right
/// to several debtors.
#[derive(Debug, Clone)]
pub(crate) struct Loan<R> {
    pub(crate) cookie: LoanCookie,
    pub(crate) right: R,
    pub(crate) remote: Option<Arc<Remote>>,
    pub(crate) group: GroupId,
}

impl<R: Right> Loan<R> {
    pub(crate) fn new(
        cookie: LoanCookie,
        right: R,
        remote: Option<Arc<Remote>>,
        group: GroupId,
    ) -> Self {
        Self {
            cookie,
            right,
            remote,
            group,
        }
    }

    /// Shrink the loan by `returned`; true when nothing is left
    pub(crate) fn settle(&mut self, returned: &R) -> bool {
        self.right = self.right.diff(returned);
        self.right.is_empty()
    }
}
