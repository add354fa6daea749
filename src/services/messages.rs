use super::notifications::notify_in;
use super::{PortalServices, decode_all, decode_one, new_id, require_text, timestamp};
use crate::db::{Connector, SqlBackend};
use crate::error::PortalResult;
use crate::models::{
    ADMIN_RECIPIENT, Message, MessageDirection, MessageFilter, NewMessage, Statement,
    supplier_recipient,
};
use chrono::Utc;
use tracing::debug;

const MESSAGE_COLUMNS: &str =
    "id, company_id, supplier_id, direction, sender, subject, body, is_read, created_at";

impl<C> PortalServices<C>
where
    C: Connector,
    C::Pool: SqlBackend,
{
    /// Store a message and notify whoever receives it.
    pub async fn send_message(&self, company_id: &str, new: NewMessage) -> PortalResult<Message> {
        require_text("sender", &new.sender)?;
        require_text("subject", &new.subject)?;
        require_text("body", &new.body)?;
        let supplier = self.get_supplier(company_id, &new.supplier_id).await?;

        let id = new_id();
        let mut tx = self.store.begin().await?;
        tx.execute(
            Statement::new(format!(
                "INSERT INTO messages ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                MESSAGE_COLUMNS
            ))
            .bind(&id)
            .bind(company_id)
            .bind(&supplier.id)
            .bind(new.direction.as_str())
            .bind(new.sender.trim())
            .bind(new.subject.trim())
            .bind(&new.body)
            .bind(false)
            .bind(timestamp(Utc::now())),
        )
        .await?;

        let recipient = match new.direction {
            MessageDirection::ToSupplier => supplier_recipient(&supplier.id),
            MessageDirection::ToAdmin => ADMIN_RECIPIENT.to_string(),
        };
        notify_in(
            &mut tx,
            company_id,
            &recipient,
            "message",
            &format!("Nuevo mensaje: {}", new.subject.trim()),
            Some(format!("De {}", new.sender.trim())),
        )
        .await?;
        tx.commit().await?;
        debug!(company_id, message_id = %id, direction = new.direction.as_str(), "Message stored");

        self.get_message(company_id, &id).await
    }

    pub async fn get_message(&self, company_id: &str, id: &str) -> PortalResult<Message> {
        self.require_tenant(company_id)?;
        let rows = self
            .store
            .fetch(
                Statement::new(format!(
                    "SELECT {} FROM messages WHERE company_id = ? AND id = ?",
                    MESSAGE_COLUMNS
                ))
                .bind(company_id)
                .bind(id),
            )
            .await?;
        decode_one(rows, "message", id)
    }

    pub async fn list_messages(
        &self,
        company_id: &str,
        filter: MessageFilter,
    ) -> PortalResult<Vec<Message>> {
        self.require_tenant(company_id)?;
        let stmt = Statement::new(format!(
            "SELECT {} FROM messages WHERE company_id = ?",
            MESSAGE_COLUMNS
        ))
        .bind(company_id)
        .push_opt(" AND supplier_id = ?", filter.supplier_id)
        .push_opt(" AND is_read = ?", filter.unread_only.then_some(false))
        .push(" ORDER BY created_at DESC");
        decode_all(self.store.fetch(stmt).await?)
    }

    pub async fn mark_message_read(&self, company_id: &str, id: &str) -> PortalResult<Message> {
        self.get_message(company_id, id).await?;
        self.store
            .execute(
                Statement::new("UPDATE messages SET is_read = ? WHERE company_id = ? AND id = ?")
                    .bind(true)
                    .bind(company_id)
                    .bind(id),
            )
            .await?;
        self.get_message(company_id, id).await
    }
}
