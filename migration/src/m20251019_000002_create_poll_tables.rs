use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_query::Expr;

use crate::m20251019_000001_create_users::Users;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Polls::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Polls::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Polls::Question).string_len(200).not_null())
                    .col(ColumnDef::new(Polls::OwnerId).integer().null())
                    .col(
                        ColumnDef::new(Polls::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(Polls::Code).string_len(8).not_null())
                    .col(
                        ColumnDef::new(Polls::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_polls_owner")
                            .from(Polls::Table, Polls::OwnerId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Safety net behind the code generator's pre-check
        manager
            .create_index(
                Index::create()
                    .name("idx_polls_code_unique")
                    .table(Polls::Table)
                    .col(Polls::Code)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_polls_owner_created")
                    .table(Polls::Table)
                    .col(Polls::OwnerId)
                    .col(Polls::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Choices::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Choices::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Choices::PollId).integer().not_null())
                    .col(ColumnDef::new(Choices::Text).string_len(200).not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_choices_poll")
                            .from(Choices::Table, Choices::PollId)
                            .to(Polls::Table, Polls::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_choices_poll")
                    .table(Choices::Table)
                    .col(Choices::PollId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Votes::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Votes::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Votes::UserId).integer().not_null())
                    .col(ColumnDef::new(Votes::ChoiceId).integer().not_null())
                    .col(ColumnDef::new(Votes::PollId).integer().not_null())
                    .col(
                        ColumnDef::new(Votes::VotedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_votes_user")
                            .from(Votes::Table, Votes::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_votes_choice")
                            .from(Votes::Table, Votes::ChoiceId)
                            .to(Choices::Table, Choices::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_votes_poll")
                            .from(Votes::Table, Votes::PollId)
                            .to(Polls::Table, Polls::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("unique_user_choice_vote")
                    .table(Votes::Table)
                    .col(Votes::UserId)
                    .col(Votes::ChoiceId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // One vote per user per poll, enforced atomically at insert time
        manager
            .create_index(
                Index::create()
                    .name("unique_user_poll_vote")
                    .table(Votes::Table)
                    .col(Votes::UserId)
                    .col(Votes::PollId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_votes_choice")
                    .table(Votes::Table)
                    .col(Votes::ChoiceId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Votes::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Choices::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Polls::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Polls {
    Table,
    Id,
    Question,
    OwnerId,
    CreatedAt,
    Code,
    IsActive,
}

#[derive(DeriveIden)]
enum Choices {
    Table,
    Id,
    PollId,
    Text,
}

#[derive(DeriveIden)]
enum Votes {
    Table,
    Id,
    UserId,
    ChoiceId,
    PollId,
    VotedAt,
}
