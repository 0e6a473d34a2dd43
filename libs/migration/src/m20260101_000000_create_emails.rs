use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Emails::Table)
                    .if_not_exists()
                    .col(pk_uuid(Emails::Id))
                    .col(string_len(Emails::Sender, 255))
                    .col(json_binary(Emails::Recipients))
                    .col(string_len(Emails::Subject, 255))
                    .col(text(Emails::Body).default(""))
                    .col(
                        string_len(Emails::Status, 16)
                            .default("pending")
                            .check(Expr::col(Emails::Status).is_in([
                                "pending",
                                "published",
                                "sent",
                                "failed",
                            ])),
                    )
                    .col(
                        timestamp_with_time_zone(Emails::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Emails::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Keyset pagination: ORDER BY created_at DESC, id ASC
        manager
            .create_index(
                Index::create()
                    .name("idx_emails_created_at_id")
                    .table(Emails::Table)
                    .col((Emails::CreatedAt, IndexOrder::Desc))
                    .col((Emails::Id, IndexOrder::Asc))
                    .to_owned(),
            )
            .await?;

        // Reconciliation sweep: status = 'published' AND updated_at < cutoff
        manager
            .create_index(
                Index::create()
                    .name("idx_emails_status_updated_at")
                    .table(Emails::Table)
                    .col(Emails::Status)
                    .col(Emails::UpdatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Emails::Table).if_exists().to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Emails {
    Table,
    Id,
    Sender,
    Recipients,
    Subject,
    Body,
    Status,
    CreatedAt,
    UpdatedAt,
}
