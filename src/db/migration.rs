use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(Migration001CreateTables)]
    }
}

pub struct Migration001CreateTables;

impl MigrationName for Migration001CreateTables {
    fn name(&self) -> &str {
        "m001_create_tables"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration001CreateTables {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Accounts::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Accounts::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Accounts::Name).string().not_null())
                    .col(ColumnDef::new(Accounts::SmtpHost).string().not_null())
                    .col(
                        ColumnDef::new(Accounts::SmtpPort)
                            .integer()
                            .not_null()
                            .default(587),
                    )
                    .col(ColumnDef::new(Accounts::ImapHost).string().not_null())
                    .col(
                        ColumnDef::new(Accounts::ImapPort)
                            .integer()
                            .not_null()
                            .default(993),
                    )
                    .col(ColumnDef::new(Accounts::Username).string().not_null())
                    .col(
                        ColumnDef::new(Accounts::EncryptedPassword)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Accounts::SmtpUsername).string())
                    .col(ColumnDef::new(Accounts::EncryptedSmtpPassword).text())
                    .col(ColumnDef::new(Accounts::ImapUsername).string())
                    .col(ColumnDef::new(Accounts::EncryptedImapPassword).text())
                    .col(ColumnDef::new(Accounts::DisplayName).string())
                    .col(
                        ColumnDef::new(Accounts::ApprovalRequired)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Accounts::AutoSendThreshold)
                            .double()
                            .not_null()
                            .default(0.9),
                    )
                    .col(
                        ColumnDef::new(Accounts::ReviewThreshold)
                            .double()
                            .not_null()
                            .default(0.5),
                    )
                    .col(ColumnDef::new(Accounts::RateLimitPerHour).integer())
                    .col(
                        ColumnDef::new(Accounts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Accounts::VerifiedAt).timestamp_with_time_zone())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Messages::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Messages::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Messages::AccountId).uuid().not_null())
                    .col(ColumnDef::new(Messages::MessageId).string())
                    .col(
                        ColumnDef::new(Messages::Direction)
                            .string()
                            .not_null()
                            .default("outbound"),
                    )
                    .col(ColumnDef::new(Messages::FromAddr).string().not_null())
                    .col(ColumnDef::new(Messages::ToAddr).string().not_null())
                    .col(ColumnDef::new(Messages::Subject).string())
                    .col(
                        ColumnDef::new(Messages::Status)
                            .string()
                            .not_null()
                            .default("queued"),
                    )
                    .col(ColumnDef::new(Messages::Error).text())
                    .col(ColumnDef::new(Messages::TextContent).text())
                    .col(ColumnDef::new(Messages::HtmlContent).text())
                    .col(
                        ColumnDef::new(Messages::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Messages::NextRetryAt).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(Messages::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Messages::SentAt).timestamp_with_time_zone())
                    .foreign_key(
                        ForeignKey::create()
                            .from(Messages::Table, Messages::AccountId)
                            .to(Accounts::Table, Accounts::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_messages_queue")
                    .table(Messages::Table)
                    .col(Messages::Status)
                    .col(Messages::NextRetryAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Drafts::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Drafts::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Drafts::AccountId).uuid().not_null())
                    .col(
                        ColumnDef::new(Drafts::Status)
                            .string()
                            .not_null()
                            .default("draft"),
                    )
                    .col(ColumnDef::new(Drafts::ToAddr).string().not_null())
                    .col(ColumnDef::new(Drafts::Subject).string())
                    .col(ColumnDef::new(Drafts::TextContent).text())
                    .col(ColumnDef::new(Drafts::HtmlContent).text())
                    .col(ColumnDef::new(Drafts::InReplyTo).string())
                    .col(ColumnDef::new(Drafts::Metadata).json_binary())
                    .col(ColumnDef::new(Drafts::MessageId).string())
                    .col(ColumnDef::new(Drafts::SendAfter).timestamp_with_time_zone())
                    .col(ColumnDef::new(Drafts::SnoozedUntil).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(Drafts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Drafts::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Drafts::SentAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Drafts::CreatedBy).string())
                    .foreign_key(
                        ForeignKey::create()
                            .from(Drafts::Table, Drafts::AccountId)
                            .to(Accounts::Table, Accounts::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(AgentActions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AgentActions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(AgentActions::InboundMessageId)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(AgentActions::FromAddr).string())
                    .col(ColumnDef::new(AgentActions::Subject).string())
                    .col(ColumnDef::new(AgentActions::Classification).string())
                    .col(ColumnDef::new(AgentActions::Confidence).double())
                    .col(ColumnDef::new(AgentActions::Action).string())
                    .col(ColumnDef::new(AgentActions::Reasoning).text())
                    .col(ColumnDef::new(AgentActions::DraftReply).text())
                    .col(ColumnDef::new(AgentActions::EscalationNote).text())
                    .col(ColumnDef::new(AgentActions::OutboundMessageId).uuid())
                    .col(
                        ColumnDef::new(AgentActions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MessageEmbeddings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MessageEmbeddings::MessageId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(MessageEmbeddings::AccountId).uuid().not_null())
                    .col(
                        ColumnDef::new(MessageEmbeddings::ContentHash)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(MessageEmbeddings::Embedding)
                            .binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(MessageEmbeddings::Model).string().not_null())
                    .col(
                        ColumnDef::new(MessageEmbeddings::EmbeddedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(MessageEmbeddings::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AgentActions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Drafts::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Messages::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Accounts::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(Iden)]
enum Accounts {
    Table,
    Id,
    Name,
    SmtpHost,
    SmtpPort,
    ImapHost,
    ImapPort,
    Username,
    EncryptedPassword,
    SmtpUsername,
    EncryptedSmtpPassword,
    ImapUsername,
    EncryptedImapPassword,
    DisplayName,
    ApprovalRequired,
    AutoSendThreshold,
    ReviewThreshold,
    RateLimitPerHour,
    CreatedAt,
    VerifiedAt,
}

#[derive(Iden)]
enum Messages {
    Table,
    Id,
    AccountId,
    MessageId,
    Direction,
    FromAddr,
    ToAddr,
    Subject,
    Status,
    Error,
    TextContent,
    HtmlContent,
    RetryCount,
    NextRetryAt,
    CreatedAt,
    SentAt,
}

#[derive(Iden)]
enum Drafts {
    Table,
    Id,
    AccountId,
    Status,
    ToAddr,
    Subject,
    TextContent,
    HtmlContent,
    InReplyTo,
    Metadata,
    MessageId,
    SendAfter,
    SnoozedUntil,
    CreatedAt,
    UpdatedAt,
    SentAt,
    CreatedBy,
}

#[derive(Iden)]
enum AgentActions {
    Table,
    Id,
    InboundMessageId,
    FromAddr,
    Subject,
    Classification,
    Confidence,
    Action,
    Reasoning,
    DraftReply,
    EscalationNote,
    OutboundMessageId,
    CreatedAt,
}

#[derive(Iden)]
enum MessageEmbeddings {
    Table,
    MessageId,
    AccountId,
    ContentHash,
    Embedding,
    Model,
    EmbeddedAt,
}
