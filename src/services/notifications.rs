use super::{
    PortalServices, StoreTransaction, decode_all, decode_one, new_id, require_text, timestamp,
};
use crate::db::{Connector, SqlBackend, SqlTransaction};
use crate::error::PortalResult;
use crate::models::{NewNotification, Notification, Statement};
use chrono::Utc;

const NOTIFICATION_COLUMNS: &str = "id, company_id, recipient, kind, title, body, is_read, created_at";

impl<C> PortalServices<C>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    pub async fn create_notification(
        &self,
        company_id: &str,
        new: NewNotification,
    ) -> PortalResult<Notification> {
        self.require_tenant(company_id)?;
        require_text("recipient", &new.recipient)?;
        require_text("kind", &new.kind)?;
        require_text("title", &new.title)?;
        self.notify(company_id, &new.recipient, &new.kind, &new.title, new.body)
            .await
    }

    pub async fn list_notifications(
        &self,
        company_id: &str,
        recipient: &str,
        unread_only: bool,
    ) -> PortalResult<Vec<Notification>> {
        self.require_tenant(company_id)?;
        let stmt = Statement::new(format!(
            "SELECT {} FROM notifications WHERE company_id = ? AND recipient = ?",
            NOTIFICATION_COLUMNS
        ))
        .bind(company_id)
        .bind(recipient)
        .push_opt(" AND is_read = ?", unread_only.then_some(false))
        .push(" ORDER BY created_at DESC");
        decode_all(self.store.fetch(stmt).await?)
    }

    pub async fn mark_notification_read(
        &self,
        company_id: &str,
        id: &str,
    ) -> PortalResult<Notification> {
        self.require_tenant(company_id)?;
        let affected = self
            .store
            .execute(
                Statement::new("UPDATE notifications SET is_read = ? WHERE company_id = ? AND id = ?")
                    .bind(true)
                    .bind(company_id)
                    .bind(id),
            )
            .await?;
        tracing::trace!(affected, "Notification marked read");
        self.get_notification(company_id, id).await
    }

    /// Returns the number of notifications that changed.
    pub async fn mark_all_read(&self, company_id: &str, recipient: &str) -> PortalResult<u64> {
        self.require_tenant(company_id)?;
        self.store
            .execute(
                Statement::new(
                    "UPDATE notifications SET is_read = ? \
                     WHERE company_id = ? AND recipient = ? AND is_read = ?",
                )
                .bind(true)
                .bind(company_id)
                .bind(recipient)
                .bind(false),
            )
            .await
    }

    async fn get_notification(&self, company_id: &str, id: &str) -> PortalResult<Notification> {
        let rows = self
            .store
            .fetch(
                Statement::new(format!(
                    "SELECT {} FROM notifications WHERE company_id = ? AND id = ?",
                    NOTIFICATION_COLUMNS
                ))
                .bind(company_id)
                .bind(id),
            )
            .await?;
        decode_one(rows, "notification", id)
    }

    pub(super) async fn notify(
        &self,
        company_id: &str,
        recipient: &str,
        kind: &str,
        title: &str,
        body: Option<String>,
    ) -> PortalResult<Notification> {
        let (id, insert) = notification_insert(company_id, recipient, kind, title, body);
        self.store.execute(insert).await?;
        self.get_notification(company_id, &id).await
    }
}

/// Queue a notification inside a transaction; it appears only on commit.
pub(super) async fn notify_in<T: SqlTransaction>(
    tx: &mut StoreTransaction<T>,
    company_id: &str,
    recipient: &str,
    kind: &str,
    title: &str,
    body: Option<String>,
) -> PortalResult<()> {
    let (_, insert) = notification_insert(company_id, recipient, kind, title, body);
    tx.execute(insert).await?;
    Ok(())
}

fn notification_insert(
    company_id: &str,
    recipient: &str,
    kind: &str,
    title: &str,
    body: Option<String>,
) -> (String, Statement) {
    let id = new_id();
    let insert = Statement::new(format!(
        "INSERT INTO notifications ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        NOTIFICATION_COLUMNS
    ))
    .bind(&id)
    .bind(company_id)
    .bind(recipient)
    .bind(kind)
    .bind(title)
    .bind(body)
    .bind(false)
    .bind(timestamp(Utc::now()));
    (id, insert)
}
